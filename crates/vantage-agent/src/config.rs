//! 配置管理模块
//!
//! 该模块负责加载和管理代理的配置：内置默认值之上叠加可选的 YAML/JSON 配置
//! 文件与 `VANTAGE__` 前缀的环境变量，最后由命令行参数覆盖。

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use vantage_prober::{ProberConfig, DEFAULT_PROBING_THREADS};

/// 默认 RPC 端口
pub const DEFAULT_PORT: u16 = 54321;

/// 控制器地址发现端点
pub const DEFAULT_DISCOVERY_URL: &str = "http://revtr.cs.washington.edu/vps/registrar.txt";

/// 按主机名下发探测线程数的端点
pub const DEFAULT_RATE_LIMIT_URL: &str = "http://revtr.cs.washington.edu/vps/RateLimit.txt";

/// 组件发布地址
pub const DEFAULT_UPDATE_BASE_URL: &str = "http://revtr.cs.washington.edu/vps";

/// 代理配置结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// RPC 服务配置
    pub rpc: RpcConfig,
    /// 控制器配置
    pub controller: ControllerConfig,
    /// 探测工具配置
    pub probing: ProbingConfig,
    /// 自更新配置
    pub update: UpdateConfig,
    /// 日志级别
    pub log_level: String,
    /// 单实例锁文件
    pub pid_file: PathBuf,
}

/// RPC 服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// 监听端口
    pub port: u16,
    /// 是否只允许本机与控制器主机访问
    pub acl: bool,
    /// 是否在固定路径 `/rpc` 暴露代理
    pub front: bool,
}

/// 控制器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// 固定的控制器地址；为空时通过发现端点获取，并启用周期性重新注册
    pub uri: Option<String>,
    /// 控制器地址发现端点
    pub discovery_url: String,
    /// 探测线程数下发端点，为空时不查询
    pub rate_limit_url: Option<String>,
    /// 重新注册策略
    pub refresh: RefreshConfig,
    /// 调用控制器与 HTTP 拉取的超时（秒）
    pub timeout_secs: u64,
}

/// 重新注册策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// 周期基数（秒）
    pub period_secs: u64,
    /// 周期随机抖动上限（秒）
    pub jitter_secs: u64,
    /// 首次失败后的重试基数（秒）
    pub retry_secs: u64,
    /// 重试随机抖动上限（秒）
    pub retry_jitter_secs: u64,
    /// 重试额外抖动上限（秒）
    pub retry_extra_jitter_secs: u64,
}

/// 探测工具配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbingConfig {
    /// 探测工具目录
    pub tool_dir: PathBuf,
    /// 临时输出目录
    pub output_dir: PathBuf,
    /// 探测线程数
    pub threads: u32,
    /// 是否经由 sudo 调用工具
    pub use_sudo: bool,
    /// 假定目的地回程与首跳对称；关闭后对目的地也发起探测
    pub backoff: bool,
}

/// 自更新配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// 是否启用更新循环
    pub enabled: bool,
    /// 启动后首次检查前的等待（秒）
    pub check_delay_secs: u64,
    /// 检查周期基数（秒）
    pub period_secs: u64,
    /// 周期随机抖动上限（秒）
    pub jitter_secs: u64,
    /// 组件发布地址
    pub base_url: String,
    /// 代理与配置组件的安装目录
    pub install_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            controller: ControllerConfig::default(),
            probing: ProbingConfig::default(),
            update: UpdateConfig::default(),
            log_level: "info".to_string(),
            pid_file: PathBuf::from("/tmp/vantage-agent.pid"),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            acl: true,
            front: true,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            uri: None,
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            rate_limit_url: Some(DEFAULT_RATE_LIMIT_URL.to_string()),
            refresh: RefreshConfig::default(),
            timeout_secs: 30,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            period_secs: 3600,
            jitter_secs: 3600,
            retry_secs: 120,
            retry_jitter_secs: 120,
            retry_extra_jitter_secs: 10,
        }
    }
}

impl Default for ProbingConfig {
    fn default() -> Self {
        Self {
            tool_dir: PathBuf::from("./"),
            output_dir: PathBuf::from("/tmp/"),
            threads: DEFAULT_PROBING_THREADS,
            use_sudo: true,
            backoff: true,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_delay_secs: 5,
            period_secs: 36000,
            jitter_secs: 36000,
            base_url: DEFAULT_UPDATE_BASE_URL.to_string(),
            install_dir: PathBuf::from("./"),
        }
    }
}

impl ProbingConfig {
    /// 转换为探测层配置
    pub fn to_prober_config(&self) -> ProberConfig {
        ProberConfig {
            tool_dir: self.tool_dir.clone(),
            output_dir: self.output_dir.clone(),
            threads: self.threads,
            use_sudo: self.use_sudo,
        }
    }
}

impl ControllerConfig {
    /// 请求超时
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 配置管理器
pub struct ConfigManager {
    /// 配置文件路径
    config_path: Option<PathBuf>,
    /// 当前配置
    config: AgentConfig,
}

impl ConfigManager {
    /// 创建新的配置管理器，`config_path` 为空时只使用默认值与环境变量
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let config = Self::load_config(config_path).context(match config_path {
            Some(path) => format!("无法加载配置文件: {:?}", path),
            None => "无法加载配置".to_string(),
        })?;

        Ok(Self {
            config_path: config_path.map(Path::to_path_buf),
            config,
        })
    }

    /// 加载配置
    fn load_config(config_path: Option<&Path>) -> Result<AgentConfig> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

            // 确定配置文件格式
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
            };
            builder = builder.add_source(File::with_name(config_file).format(format));
        }

        let config = builder
            .add_source(Environment::with_prefix("VANTAGE").separator("__"))
            .build()
            .context("构建配置失败")?;

        let agent_config = config
            .try_deserialize::<AgentConfig>()
            .context("配置格式错误")?;

        Ok(agent_config)
    }

    /// 配置文件路径
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 获取完整配置
    pub fn get_config(&self) -> &AgentConfig {
        &self.config
    }

    /// 应用命令行覆盖并取出配置
    pub fn into_config(mut self, cli: &CliArgs) -> AgentConfig {
        cli.apply(&mut self.config);
        info!("配置加载完成: {:?}", self.config_path);
        self.config
    }
}

/// 命令行参数
#[derive(Parser, Debug, Clone, Default, PartialEq)]
#[command(name = "vantage-agent", version, about = "分布式主动测量平台的探测点代理")]
pub struct CliArgs {
    /// 配置文件（YAML 或 JSON）
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// 控制器 URI，默认从发现端点获取
    #[arg(short = 'c', long = "controller", value_name = "URI")]
    pub controller_uri: Option<String>,

    /// 关闭访问控制，否则只允许本机与控制器主机连接
    #[arg(short = 'A', long = "no-acl")]
    pub no_acl: bool,

    /// 不在固定路径暴露代理
    #[arg(short = 'F', long = "no-front")]
    pub no_front: bool,

    /// RPC 端口
    #[arg(short = 'p', long, value_name = "PORT")]
    pub port: Option<u16>,

    /// 探测工具目录
    #[arg(short = 't', long = "tools", value_name = "PATH")]
    pub tool_dir: Option<PathBuf>,

    /// 临时输出目录
    #[arg(short = 'o', long = "out", value_name = "PATH")]
    pub output_dir: Option<PathBuf>,

    /// 日志级别
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// 单实例锁文件
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// 关闭自更新循环
    #[arg(long)]
    pub no_update: bool,

    /// 启用目的地探测，不再假定目的地回程与首跳对称
    #[arg(short = 'd', long = "destination-probing")]
    pub destination_probing: bool,
}

impl CliArgs {
    /// 用命令行参数覆盖配置
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(uri) = &self.controller_uri {
            config.controller.uri = Some(uri.clone());
        }
        if self.no_acl {
            config.rpc.acl = false;
        }
        if self.no_front {
            config.rpc.front = false;
        }
        if let Some(port) = self.port {
            config.rpc.port = port;
        }
        if let Some(dir) = &self.tool_dir {
            config.probing.tool_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.probing.output_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(path) = &self.pid_file {
            config.pid_file = path.clone();
        }
        if self.no_update {
            config.update.enabled = false;
        }
        if self.destination_probing {
            config.probing.backoff = false;
        }
    }
}

/// 创建默认配置
pub fn create_default_config() -> AgentConfig {
    AgentConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = create_default_config();
        assert_eq!(config.rpc.port, 54321);
        assert!(config.rpc.acl);
        assert!(config.rpc.front);
        assert_eq!(config.probing.tool_dir, PathBuf::from("./"));
        assert_eq!(config.probing.output_dir, PathBuf::from("/tmp/"));
        assert_eq!(config.probing.threads, 40);
        assert_eq!(config.controller.discovery_url, DEFAULT_DISCOVERY_URL);
        assert_eq!(config.controller.refresh.period_secs, 3600);
        assert_eq!(config.update.period_secs, 36000);
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "rpc:\n  port: 6000\n  acl: false\nprobing:\n  threads: 8\ncontroller:\n  uri: http://ctl.example.org:5000"
        )
        .unwrap();

        let manager = ConfigManager::new(Some(file.path())).unwrap();
        let config = manager.get_config();
        assert_eq!(config.rpc.port, 6000);
        assert!(!config.rpc.acl);
        assert!(config.rpc.front);
        assert_eq!(config.probing.threads, 8);
        assert_eq!(config.probing.output_dir, PathBuf::from("/tmp/"));
        assert_eq!(config.controller.uri.as_deref(), Some("http://ctl.example.org:5000"));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(ConfigManager::new(Some(file.path())).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::try_parse_from([
            "vantage-agent",
            "-A",
            "-F",
            "-p",
            "7000",
            "-c",
            "http://ctl:5000",
            "-t",
            "/opt/tools",
            "--no-update",
        ])
        .unwrap();

        let mut config = create_default_config();
        cli.apply(&mut config);
        assert!(!config.rpc.acl);
        assert!(!config.rpc.front);
        assert_eq!(config.rpc.port, 7000);
        assert_eq!(config.controller.uri.as_deref(), Some("http://ctl:5000"));
        assert_eq!(config.probing.tool_dir, PathBuf::from("/opt/tools"));
        assert_eq!(config.probing.output_dir, PathBuf::from("/tmp/"));
        assert!(!config.update.enabled);
        assert!(config.probing.backoff);
    }

    #[test]
    fn test_destination_probing_disables_backoff() {
        let mut config = create_default_config();
        CliArgs::try_parse_from(["vantage-agent", "-d"])
            .unwrap()
            .apply(&mut config);
        assert!(!config.probing.backoff);

        let mut config = create_default_config();
        CliArgs::try_parse_from(["vantage-agent", "--destination-probing"])
            .unwrap()
            .apply(&mut config);
        assert!(!config.probing.backoff);
    }
}
