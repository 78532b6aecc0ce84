//! 自更新
//!
//! 每个组件在更新服务器上有一个版本文件 `{组件}_version.txt` 和一个制品。
//! 已发布版本与已安装版本不同时下载制品并原子替换；代理与配置更新后需要
//! 整体重启（重新执行自身），探测工具包更新后由之后的子进程直接使用。

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use vantage_common::{Component, Error, Result, Version};

use crate::config::UpdateConfig;
use crate::fetch::{get_text, HttpFetcher};
use crate::metrics::MetricsCollector;
use crate::registration::jitter;
use crate::LifecycleEvent;

/// 已安装版本记录文件
const VERSIONS_FILE: &str = ".vantage-versions.json";

/// 探测工具包制品
const PROBER_ARTIFACT: &str = "prober.tar.gz";

/// 代理二进制
pub const AGENT_ARTIFACT: &str = "vantage-agent";

/// 代理配置
pub const CONFIG_ARTIFACT: &str = "vantage-agent.yaml";

/// 自更新管理器
pub struct SelfUpdateManager {
    fetcher: Arc<dyn HttpFetcher>,
    config: UpdateConfig,
    tool_dir: PathBuf,
    metrics: Arc<MetricsCollector>,
    installed: RwLock<HashMap<Component, Version>>,
}

impl SelfUpdateManager {
    /// 创建新的自更新管理器，读取上次记录的已安装版本
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        config: UpdateConfig,
        tool_dir: impl Into<PathBuf>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let mut installed = load_versions(&config.install_dir.join(VERSIONS_FILE));
        installed
            .entry(Component::Agent)
            .or_insert_with(|| Version::new(env!("CARGO_PKG_VERSION")));

        Self {
            fetcher,
            config,
            tool_dir: tool_dir.into(),
            metrics,
            installed: RwLock::new(installed),
        }
    }

    /// 版本文件地址
    pub fn version_url(&self, component: Component) -> String {
        format!("{}/{}_version.txt", self.base_url(), component)
    }

    /// 制品地址
    pub fn artifact_url(&self, component: Component) -> String {
        format!("{}/{}", self.base_url(), artifact_name(component))
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// 制品的安装位置
    pub fn install_path(&self, component: Component) -> PathBuf {
        match component {
            Component::Prober => self.tool_dir.join(PROBER_ARTIFACT),
            Component::Agent | Component::Config => {
                self.config.install_dir.join(artifact_name(component))
            }
        }
    }

    /// 已安装版本，未知时为空
    pub fn installed_version(&self, component: Component) -> Option<Version> {
        self.installed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&component)
            .cloned()
    }

    /// 代理当前版本
    pub fn agent_version(&self) -> String {
        self.installed_version(Component::Agent)
            .map(|v| v.to_string())
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    /// 查询已发布版本，内容无法解析或为零时视为错误
    pub async fn published_version(&self, component: Component) -> Result<Version> {
        let url = self.version_url(component);
        let body = get_text(self.fetcher.as_ref(), &url).await?;
        Version::parse_published(&body)
            .ok_or_else(|| Error::Update(format!("{} 返回的版本号无效: {:?}", url, body.trim())))
    }

    /// 检查并在版本不同时安装更新，返回是否安装了新版本
    pub async fn check_for_update(&self, component: Component) -> Result<bool> {
        let published = self.published_version(component).await?;
        let installed = self.installed_version(component);
        if installed.as_ref() == Some(&published) {
            debug!("{} 已是最新版本 {}", component, published);
            return Ok(false);
        }

        info!(
            "{} 有新版本: {} -> {}",
            component,
            installed.map(|v| v.to_string()).unwrap_or_else(|| "未知".to_string()),
            published
        );
        self.download(component, published).await?;
        Ok(true)
    }

    /// 无条件安装组件的已发布版本
    pub async fn install(&self, component: Component) -> Result<Version> {
        let published = self.published_version(component).await?;
        self.download(component, published.clone()).await?;
        Ok(published)
    }

    async fn download(&self, component: Component, version: Version) -> Result<()> {
        let url = self.artifact_url(component);
        let body = self.fetcher.get(&url).await?;
        if body.is_empty() {
            return Err(Error::Update(format!("{} 返回空内容", url)));
        }

        let target = self.install_path(component);
        write_atomically(&target, &body).await?;
        if component == Component::Prober {
            unpack(&target, &self.tool_dir).await?;
        }

        info!("已安装 {} {} 到 {:?}", component, version, target);
        self.metrics.record_update();
        self.record_version(component, version).await;
        Ok(())
    }

    async fn record_version(&self, component: Component, version: Version) {
        let snapshot: HashMap<String, Version> = {
            let mut installed = self
                .installed
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            installed.insert(component, version);
            installed
                .iter()
                .map(|(component, version)| (component.to_string(), version.clone()))
                .collect()
        };

        let path = self.config.install_dir.join(VERSIONS_FILE);
        let result = match serde_json::to_vec_pretty(&snapshot) {
            Ok(body) => write_atomically(&path, &body).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("无法记录已安装版本到 {:?}: {}", path, e);
        }
    }

    /// 依次检查所有组件，返回是否需要重启
    ///
    /// 单个组件失败只记录日志，不影响其余组件。
    pub async fn check_all(&self) -> bool {
        let mut restart = false;
        for component in Component::ALL {
            match self.check_for_update(component).await {
                Ok(true) => restart |= component.restart_required(),
                Ok(false) => {}
                Err(e) => error!("检查 {} 更新失败: {}", component, e),
            }
        }
        restart
    }

    /// 自更新循环；需要重启时发出事件并返回
    pub async fn run_update_loop(&self, events: mpsc::UnboundedSender<LifecycleEvent>) {
        tokio::time::sleep(Duration::from_secs(self.config.check_delay_secs)).await;
        loop {
            if self.check_all().await {
                info!("更新需要重启代理");
                let _ = events.send(LifecycleEvent::Restart);
                return;
            }
            let delay = Duration::from_secs(self.config.period_secs) + jitter(self.config.jitter_secs);
            debug!("{:?} 后再次检查更新", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

fn artifact_name(component: Component) -> &'static str {
    match component {
        Component::Prober => PROBER_ARTIFACT,
        Component::Agent => AGENT_ARTIFACT,
        Component::Config => CONFIG_ARTIFACT,
    }
}

fn load_versions(path: &Path) -> HashMap<Component, Version> {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(_) => return HashMap::new(),
    };
    match serde_json::from_slice::<HashMap<String, Version>>(&body) {
        Ok(recorded) => recorded
            .into_iter()
            .filter_map(|(name, version)| name.parse().ok().map(|c| (c, version)))
            .collect(),
        Err(e) => {
            warn!("已安装版本记录 {:?} 无法解析: {}", path, e);
            HashMap::new()
        }
    }
}

/// 先写同目录的临时文件再改名，保证读者看到完整内容
async fn write_atomically(target: &Path, body: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = dir.join(format!(".{}.download", name));
    tokio::fs::write(&staging, body).await?;
    tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755)).await?;
    tokio::fs::rename(&staging, target).await?;
    Ok(())
}

/// 把工具包解到工具目录
async fn unpack(archive: &Path, tool_dir: &Path) -> Result<()> {
    let output = Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(tool_dir)
        .output()
        .await
        .map_err(|e| Error::Subprocess(format!("无法执行 tar: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Update(format!(
            "解包 {:?} 失败: {}",
            archive,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
