//! 控制器注册
//!
//! 维护代理与控制器之间的关系：首次注册、切换控制器时的重新注册、注销，
//! 以及带重试的定期刷新。

use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use vantage_common::{Error, Result};

use crate::access::{needs_restart, AllowList};
use crate::config::RefreshConfig;
use crate::fetch::{discover_controller, HttpFetcher};
use crate::metrics::MetricsCollector;
use crate::rpc::{ControllerClient, ListenerControl};

/// `[0, max_secs]` 内的随机时长，`max_secs` 为零时不抖动
pub(crate) fn jitter(max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(thread_rng().gen_range(0..=max_secs))
}

/// 刷新节奏
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    period: Duration,
    jitter_secs: u64,
    retry: Duration,
    retry_jitter_secs: u64,
    retry_extra_jitter_secs: u64,
}

impl RefreshPolicy {
    /// 由配置构造
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            period: Duration::from_secs(config.period_secs),
            jitter_secs: config.jitter_secs,
            retry: Duration::from_secs(config.retry_secs),
            retry_jitter_secs: config.retry_jitter_secs,
            retry_extra_jitter_secs: config.retry_extra_jitter_secs,
        }
    }

    /// 两次刷新之间的等待
    pub fn cycle_delay(&self) -> Duration {
        self.period + jitter(self.jitter_secs)
    }

    /// 首次失败后的重试等待
    pub fn retry_delay(&self) -> Duration {
        self.retry + jitter(self.retry_jitter_secs) + jitter(self.retry_extra_jitter_secs)
    }
}

/// 注册状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// 尚未注册
    Unregistered,
    /// 已向该控制器注册
    Registered(String),
}

#[derive(Debug, Default)]
struct Inner {
    controller_uri: Option<String>,
    registered: bool,
}

/// 注册管理器
pub struct RegistrationManager {
    client: Arc<dyn ControllerClient>,
    listener: Arc<dyn ListenerControl>,
    fetcher: Arc<dyn HttpFetcher>,
    acl: bool,
    discovery_url: String,
    policy: RefreshPolicy,
    metrics: Arc<MetricsCollector>,
    inner: Mutex<Inner>,
}

impl RegistrationManager {
    /// 创建新的注册管理器
    pub fn new(
        client: Arc<dyn ControllerClient>,
        listener: Arc<dyn ListenerControl>,
        fetcher: Arc<dyn HttpFetcher>,
        acl: bool,
        discovery_url: impl Into<String>,
        policy: RefreshPolicy,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            client,
            listener,
            fetcher,
            acl,
            discovery_url: discovery_url.into(),
            policy,
            metrics,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// 当前控制器地址
    pub async fn controller_uri(&self) -> Option<String> {
        self.inner.lock().await.controller_uri.clone()
    }

    /// 当前注册状态
    pub async fn state(&self) -> RegistrationState {
        let inner = self.inner.lock().await;
        match (&inner.controller_uri, inner.registered) {
            (Some(uri), true) => RegistrationState::Registered(uri.clone()),
            _ => RegistrationState::Unregistered,
        }
    }

    /// 访问发现端点取得控制器地址
    pub async fn discover(&self) -> Result<String> {
        discover_controller(self.fetcher.as_ref(), &self.discovery_url).await
    }

    /// 向控制器注册；`controller` 为空时使用已知的控制器
    pub async fn register(&self, controller: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.register_locked(&mut inner, controller).await
    }

    /// 从已知控制器注销，失败只记录日志
    pub async fn unregister(&self) {
        let mut inner = self.inner.lock().await;
        self.unregister_locked(&mut inner).await;
    }

    /// 注销并停止监听
    pub async fn stop_service(&self) {
        let mut inner = self.inner.lock().await;
        self.stop_service_locked(&mut inner).await;
    }

    /// 切换到新的控制器
    ///
    /// 空地址或与当前相同的地址不做任何事。启用访问控制且主机变化时先停止
    /// 监听，注册时再用新的允许列表重新启动。
    pub async fn update_controller(&self, uri: &str) -> Result<()> {
        let uri = uri.trim();
        let mut inner = self.inner.lock().await;
        if uri.is_empty() || inner.controller_uri.as_deref() == Some(uri) {
            debug!("控制器未变化，忽略: {:?}", uri);
            return Ok(());
        }

        if let Some(old) = inner.controller_uri.clone() {
            if needs_restart(self.acl, &old, uri) {
                info!("控制器主机由 {} 变为 {}，重启监听器", old, uri);
                self.stop_service_locked(&mut inner).await;
            } else {
                self.unregister_locked(&mut inner).await;
            }
        }

        info!("控制器切换为 {}", uri);
        inner.controller_uri = Some(uri.to_string());
        self.register_locked(&mut inner, None).await
    }

    async fn register_locked(&self, inner: &mut Inner, controller: Option<&str>) -> Result<()> {
        let target = controller
            .map(str::to_string)
            .or_else(|| inner.controller_uri.clone());

        if !self.listener.is_running() {
            if !self.acl {
                self.listener.start(None).await?;
            } else if let Some(uri) = target.as_deref() {
                let allow = AllowList::build(uri).await?;
                self.listener.start(Some(allow)).await?;
            } else {
                warn!("启用了访问控制但控制器未知，暂不启动监听器");
            }
        }

        let Some(target) = target else {
            self.metrics.record_registration(false);
            return Err(Error::MissingControllerUri);
        };
        let agent_ref = self
            .listener
            .agent_ref()
            .ok_or_else(|| Error::Rpc("监听器未运行，无法注册".to_string()))?;

        match self.client.register(&target, &agent_ref).await {
            Ok(()) => {
                self.metrics.record_registration(true);
                inner.registered = inner.controller_uri.as_deref() == Some(target.as_str());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_registration(false);
                Err(e)
            }
        }
    }

    async fn unregister_locked(&self, inner: &mut Inner) {
        inner.registered = false;
        let (Some(uri), Some(agent_ref)) = (inner.controller_uri.as_deref(), self.listener.agent_ref())
        else {
            return;
        };
        if let Err(e) = self.client.unregister(uri, &agent_ref).await {
            warn!("从 {} 注销失败: {}", uri, e);
        }
    }

    async fn stop_service_locked(&self, inner: &mut Inner) {
        self.unregister_locked(inner).await;
        self.listener.stop().await;
    }

    /// 一次刷新尝试；此前失败过时先重新发现控制器
    pub async fn refresh_attempt(&self, failed: u32) -> Result<()> {
        if failed > 0 {
            match self.discover().await {
                Ok(uri) => self.update_controller(&uri).await?,
                Err(e) => warn!("重新发现控制器失败: {}", e),
            }
        }
        self.register(None).await
    }

    /// 一个刷新周期：首次失败且属于瞬时故障时等待片刻重试一次，否则等下个周期
    ///
    /// `failed` 在周期之间保留，成功时归零。
    pub async fn refresh_cycle(&self, failed: &mut u32) {
        loop {
            match self.refresh_attempt(*failed).await {
                Ok(()) => {
                    if *failed > 0 {
                        info!("刷新注册恢复正常");
                    }
                    *failed = 0;
                    return;
                }
                Err(e) => {
                    *failed += 1;
                    if *failed == 1 && e.is_transient() {
                        let delay = self.policy.retry_delay();
                        warn!("刷新注册失败: {}，{:?} 后重试", e, delay);
                        tokio::time::sleep(delay).await;
                    } else {
                        error!("刷新注册连续失败 {} 次: {}，等待下个周期", failed, e);
                        return;
                    }
                }
            }
        }
    }

    /// 定期刷新循环，不会返回
    pub async fn run_refresh_loop(&self) {
        let mut failed = 0;
        loop {
            tokio::time::sleep(self.policy.cycle_delay()).await;
            self.refresh_cycle(&mut failed).await;
        }
    }
}
