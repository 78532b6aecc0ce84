//! 外部工具调用
//!
//! 所有子进程都以参数列表的形式构造，从不拼接 shell 命令字符串，目标主机名
//! 因而无法注入命令。探测工具需要特权时统一由 `sudo` 前缀拉起，输出文件随后
//! 改回调用用户所有，才能在带粘滞位的临时目录中删除。

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use vantage_common::{Error, Result};

/// 探测工具的默认线程数
pub const DEFAULT_PROBING_THREADS: u32 = 40;

/// 探测层配置
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// 探测工具所在目录
    pub tool_dir: PathBuf,
    /// 临时输出目录
    pub output_dir: PathBuf,
    /// 传给探测工具的线程数
    pub threads: u32,
    /// 是否经由 sudo 调用工具
    pub use_sudo: bool,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            tool_dir: PathBuf::from("./"),
            output_dir: PathBuf::from("/tmp/"),
            threads: DEFAULT_PROBING_THREADS,
            use_sudo: true,
        }
    }
}

/// 工具调用器
pub struct ToolRunner {
    /// 探测层配置
    config: ProberConfig,
    /// 探测网卡
    device: String,
}

impl ToolRunner {
    /// 创建新的工具调用器
    pub fn new(config: ProberConfig, device: impl Into<String>) -> Self {
        Self {
            config,
            device: device.into(),
        }
    }

    /// 探测网卡
    pub fn device(&self) -> &str {
        &self.device
    }

    /// 探测层配置
    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    /// 工具的完整路径
    pub fn tool_path(&self, tool: &str) -> PathBuf {
        self.config.tool_dir.join(tool)
    }

    /// 构造命令，需要时加上 sudo 前缀
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = if self.config.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.stdin(Stdio::null());
        cmd
    }

    /// 构造标准探测命令：`<tool> <threads> <work_file> <device> <extra...>`
    pub fn probe_command<I, S>(&self, tool: &str, work_file: &Path, extra: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(self.tool_path(tool));
        cmd.arg(self.config.threads.to_string())
            .arg(work_file)
            .arg(&self.device)
            .args(extra);
        cmd
    }

    /// 运行命令直到结束，非零退出视为失败
    pub async fn run(&self, tool: &str, mut cmd: Command) -> Result<Output> {
        debug!("运行 {}: {:?}", tool, cmd.as_std());
        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Subprocess(format!("无法启动 {}: {}", tool, e)))?;

        if !output.status.success() {
            return Err(Error::Subprocess(format!(
                "{} 异常退出 ({}): {}",
                tool,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    /// 在后台启动命令，立即返回子进程
    pub fn spawn(&self, tool: &str, mut cmd: Command) -> Result<Child> {
        debug!("后台启动 {}: {:?}", tool, cmd.as_std());
        cmd.spawn()
            .map_err(|e| Error::Subprocess(format!("无法启动 {}: {}", tool, e)))
    }

    /// 把工具输出文件改回调用用户所有，尽力而为
    pub async fn fix_ownership(&self, files: &[PathBuf]) {
        if !self.config.use_sudo {
            return;
        }
        let existing: Vec<&PathBuf> = files.iter().filter(|f| f.exists()).collect();
        if existing.is_empty() {
            return;
        }

        // SAFETY: getuid 总是成功且没有副作用
        let uid = unsafe { libc::getuid() };
        let mut cmd = self.command("chown");
        cmd.arg(uid.to_string()).args(existing);
        match cmd.status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("chown 异常退出: {}", status),
            Err(e) => warn!("无法运行 chown: {}", e),
        }
    }

    /// 按命令行模式强制终止进程（`pkill -9 -f`），没有匹配不算错误
    pub async fn kill_matching(&self, pattern: &str) {
        let mut cmd = self.command("pkill");
        cmd.args(["-9", "-f", pattern]);
        match cmd.status().await {
            Ok(status) => match status.code() {
                Some(0) => info!("已终止匹配 {:?} 的进程", pattern),
                Some(1) => debug!("没有匹配 {:?} 的进程", pattern),
                _ => warn!("pkill {:?} 异常退出: {}", pattern, status),
            },
            Err(e) => warn!("无法运行 pkill: {}", e),
        }
    }

    /// 强制终止后台作业并回收
    pub async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        if self.config.use_sudo {
            // 子进程是 root 身份的 sudo，先杀掉它拉起的工具，再杀 sudo 本身
            let pid = pid.to_string();
            let mut children = self.command("pkill");
            children.args(["-9", "-P", pid.as_str()]);
            if let Err(e) = children.status().await {
                warn!("无法终止进程 {} 的子进程: {}", pid, e);
            }
            let mut parent = self.command("kill");
            parent.args(["-9", pid.as_str()]);
            if let Err(e) = parent.status().await {
                warn!("无法终止进程 {}: {}", pid, e);
            }
        } else if let Err(e) = child.start_kill() {
            warn!("无法终止进程 {}: {}", pid, e);
        }
        if let Err(e) = child.wait().await {
            warn!("回收进程 {} 失败: {}", pid, e);
        }
    }
}

/// 删除文件，失败只记日志
pub fn remove_files<P: AsRef<Path>>(files: &[P]) {
    for file in files {
        let file = file.as_ref();
        match std::fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("无法删除文件 {:?}: {}", file, e),
        }
    }
}

/// 作用域内的临时文件，离开作用域时在每条退出路径上尽力删除
pub struct ScopedFiles {
    files: Vec<PathBuf>,
}

impl ScopedFiles {
    /// 接管一组文件
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    /// 被接管的文件
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// 解除接管，文件保留
    pub fn release(mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.files)
    }
}

impl Drop for ScopedFiles {
    fn drop(&mut self) {
        remove_files(&self.files);
    }
}
