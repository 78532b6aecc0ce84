//! Vantage Agent - 分布式主动测量平台的探测点守护进程
//!
//! 该模块把探测层、RPC 服务、访问控制、控制器注册与自更新组合为一个代理：
//! 控制器通过 RPC 下发探测命令，代理在后台维持注册并定期检查更新。

pub mod access;
pub mod config;
pub mod fetch;
pub mod metrics;
pub mod registration;
pub mod rpc;
pub mod update;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use vantage_common::{
    Component, ProbeKind, ProbeTargets, RpcRequest, RpcResponse, SpoofKind, SpoofSession,
};
use vantage_prober::Prober;

use crate::config::AgentConfig;
use crate::fetch::{probing_threads_for, HttpFetcher, HyperFetcher};
use crate::metrics::MetricsCollector;
use crate::registration::{RefreshPolicy, RegistrationManager, RegistrationState};
use crate::rpc::{agent_hostname, ControllerClient, HttpControllerClient, ListenerControl, RpcHandler, RpcServer};
use crate::update::SelfUpdateManager;

/// 退出前留给进行中应答的时间
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// 进程生命周期事件，由 `main` 处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// 以给定退出码退出
    Shutdown(i32),
    /// 停止服务并重新启动
    Restart,
}

/// Agent 主结构体
pub struct Agent {
    /// 代理配置
    config: AgentConfig,
    /// 探测层
    prober: Arc<Prober>,
    /// RPC 服务
    server: Arc<RpcServer>,
    /// 控制器注册
    registration: Arc<RegistrationManager>,
    /// 自更新
    updater: Arc<SelfUpdateManager>,
    /// 指标收集器
    metrics: Arc<MetricsCollector>,
    /// 生命周期事件出口
    events: mpsc::UnboundedSender<LifecycleEvent>,
    /// 后台循环
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// 创建新的 Agent 实例
    ///
    /// 先按主机名查询下发的探测线程数，再选择探测网卡。
    pub async fn new(
        mut config: AgentConfig,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Result<Arc<Self>> {
        let fetcher: Arc<dyn HttpFetcher> = Arc::new(HyperFetcher::new(config.controller.timeout()));

        if let Some(url) = config.controller.rate_limit_url.clone() {
            let hostname = agent_hostname();
            if let Some(threads) = probing_threads_for(fetcher.as_ref(), &url, &hostname).await {
                info!("{} 的探测线程数设为 {}", hostname, threads);
                config.probing.threads = threads;
            }
        }

        let prober = Prober::new(config.probing.to_prober_config());
        let client = Arc::new(HttpControllerClient::new(config.controller.timeout()));
        Self::build(config, prober, fetcher, client, events)
    }

    /// 用给定组件组装 Agent
    pub fn build(
        config: AgentConfig,
        prober: Prober,
        fetcher: Arc<dyn HttpFetcher>,
        client: Arc<dyn ControllerClient>,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Result<Arc<Self>> {
        let metrics = Arc::new(MetricsCollector::new().context("无法创建指标收集器")?);
        let prober = Arc::new(prober);
        let updater = Arc::new(SelfUpdateManager::new(
            fetcher.clone(),
            config.update.clone(),
            config.probing.tool_dir.clone(),
            metrics.clone(),
        ));

        Ok(Arc::new_cyclic(|agent: &Weak<Agent>| {
            let handler: Weak<dyn RpcHandler> = agent.clone();
            let server = Arc::new(RpcServer::new(
                config.rpc.clone(),
                handler,
                metrics.clone(),
                prober.allocator.clone(),
            ));
            let registration = Arc::new(RegistrationManager::new(
                client,
                server.clone(),
                fetcher,
                config.rpc.acl,
                config.controller.discovery_url.clone(),
                RefreshPolicy::from_config(&config.controller.refresh),
                metrics.clone(),
            ));

            Self {
                config,
                prober,
                server,
                registration,
                updater,
                metrics,
                events,
                tasks: Mutex::new(Vec::new()),
            }
        }))
    }

    /// 启动 Agent
    ///
    /// 未指定控制器时先访问发现端点；注册失败不会中止启动，由刷新循环补救。
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.prober.spoof.kill_all_receivers().await;

        let given = self.config.controller.uri.clone();
        let mut controller = given.clone();
        if controller.is_none() {
            match self.registration.discover().await {
                Ok(uri) => controller = Some(uri),
                Err(e) => warn!("无法发现控制器: {}", e),
            }
        }

        let result = match &controller {
            Some(uri) => self.registration.update_controller(uri).await,
            None => self.registration.register(None).await,
        };
        if let Err(e) = result {
            error!("注册失败: {}", e);
        }

        match self.server.agent_ref() {
            Some(agent_ref) => info!("代理服务地址: {}", agent_ref),
            None => warn!("RPC 服务尚未启动"),
        }

        let mut tasks = self.lock_tasks();
        if self.config.update.enabled {
            let updater = self.updater.clone();
            let events = self.events.clone();
            tasks.push(tokio::spawn(async move {
                updater.run_update_loop(events).await;
            }));
        }
        if given.is_none() {
            let registration = self.registration.clone();
            tasks.push(tokio::spawn(async move {
                registration.run_refresh_loop().await;
            }));
        }
        Ok(())
    }

    /// 停止后台循环，注销并停止监听，终止未收取的异步作业
    pub async fn stop_service(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.registration.stop_service().await;
        self.prober.jobs.abort_all().await;
        self.metrics.set_tracked_jobs(0);
        info!("代理服务已停止");
    }

    /// 探测层
    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    /// RPC 服务
    pub fn server(&self) -> &RpcServer {
        &self.server
    }

    /// 自更新管理器
    pub fn updater(&self) -> &SelfUpdateManager {
        &self.updater
    }

    /// 注册状态
    pub async fn registration_state(&self) -> RegistrationState {
        self.registration.state().await
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 宽限期后发出生命周期事件，让当前应答先送出
    fn schedule(&self, event: LifecycleEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            let _ = events.send(event);
        });
    }

    async fn probe(&self, kind: ProbeKind, targets: ProbeTargets) -> vantage_common::Result<Value> {
        self.metrics.record_probe(&kind.to_string(), "sync");
        let output = self.prober.executor.run(kind, &targets).await?;
        Ok(Value::String(output))
    }

    async fn launch(&self, kind: ProbeKind, targets: ProbeTargets) -> vantage_common::Result<Value> {
        self.metrics.record_probe(&kind.to_string(), "async");
        let handle = self.prober.jobs.launch(kind, &targets).await?;
        self.metrics.set_tracked_jobs(self.prober.jobs.len().await);
        Ok(json!(handle))
    }

    async fn dispatch(&self, request: RpcRequest) -> vantage_common::Result<Value> {
        match request {
            RpcRequest::Register => {
                self.registration.register(None).await?;
                Ok(Value::Null)
            }
            RpcRequest::Unregister => {
                self.registration.unregister().await;
                Ok(Value::Null)
            }
            RpcRequest::UpdateController { uri } => {
                self.registration.update_controller(&uri).await?;
                Ok(Value::Null)
            }
            RpcRequest::Shutdown { code } => {
                info!("收到退出请求，退出码 {}", code);
                self.schedule(LifecycleEvent::Shutdown(code));
                Ok(Value::Null)
            }
            RpcRequest::Traceroute { targets } => {
                self.probe(ProbeKind::Traceroute, ProbeTargets::Hosts(targets)).await
            }
            RpcRequest::Ping { targets } => self.probe(ProbeKind::Ping, ProbeTargets::Hosts(targets)).await,
            RpcRequest::Rr { targets } => self.probe(ProbeKind::Rr, ProbeTargets::Hosts(targets)).await,
            RpcRequest::Ts { probes } => self.probe(ProbeKind::Ts, ProbeTargets::Timestamps(probes)).await,
            RpcRequest::ParisTraceroute { target } => {
                self.metrics.record_probe("paris_traceroute", "sync");
                Ok(Value::String(self.prober.executor.paris_traceroute(&target).await?))
            }
            RpcRequest::LaunchTraceroute { targets } => {
                self.launch(ProbeKind::Traceroute, ProbeTargets::Hosts(targets)).await
            }
            RpcRequest::LaunchPing { targets } => {
                self.launch(ProbeKind::Ping, ProbeTargets::Hosts(targets)).await
            }
            RpcRequest::LaunchRr { targets } => self.launch(ProbeKind::Rr, ProbeTargets::Hosts(targets)).await,
            RpcRequest::LaunchTs { probes } => {
                self.launch(ProbeKind::Ts, ProbeTargets::Timestamps(probes)).await
            }
            RpcRequest::GetResults { handle } => {
                let result = self.prober.jobs.reap(handle).await;
                self.metrics.set_tracked_jobs(self.prober.jobs.len().await);
                Ok(Value::String(result?))
            }
            RpcRequest::SpoofRr { probes, id } => {
                self.metrics.record_spoof_send("rr");
                self.prober.spoof.send_rr(&probes, id).await?;
                Ok(Value::Null)
            }
            RpcRequest::SpoofTs { probes, id } => {
                self.metrics.record_spoof_send("ts");
                self.prober.spoof.send_ts(&probes, id).await?;
                Ok(Value::Null)
            }
            RpcRequest::SpoofTr { probes, id } => {
                self.metrics.record_spoof_send("tr");
                self.prober.spoof.send_tr(&probes, id).await?;
                Ok(Value::Null)
            }
            RpcRequest::ReceiveSpoofedRr { id } => self.receive(SpoofKind::Rr, id).await,
            RpcRequest::ReceiveSpoofedTs { id } => self.receive(SpoofKind::Ts, id).await,
            RpcRequest::KillAndRetrieve { path, id } => {
                let results = self.prober.spoof.kill_and_retrieve(Path::new(&path), id).await?;
                Ok(serde_json::to_value(results)?)
            }
            RpcRequest::CheckForUpdate { component } => {
                let updated = self.updater.check_for_update(component).await?;
                if updated && component.restart_required() {
                    info!("{} 已更新，稍后重启", component);
                    self.schedule(LifecycleEvent::Restart);
                }
                Ok(Value::Bool(updated))
            }
            RpcRequest::Version => Ok(Value::String(self.updater.agent_version())),
            RpcRequest::Hostname => Ok(Value::String(self.server.hostname())),
            RpcRequest::Port => Ok(json!(self.server.port())),
            RpcRequest::Uri => Ok(json!(self.server.agent_ref())),
        }
    }

    async fn receive(&self, kind: SpoofKind, id: u32) -> vantage_common::Result<Value> {
        let path = self.prober.spoof.start_receive(SpoofSession::new(kind, id)).await?;
        Ok(Value::String(path.to_string_lossy().into_owned()))
    }
}

#[async_trait]
impl RpcHandler for Agent {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let method = request.method();
        self.metrics.record_request(method);
        let result = self.dispatch(request).await;
        if let Err(e) = &result {
            warn!("{} 失败: {}", method, e);
            self.metrics.record_error(e.kind());
        }
        RpcResponse::from_result(result)
    }

    async fn health(&self) -> Value {
        let registered = matches!(self.registration.state().await, RegistrationState::Registered(_));
        json!({
            "status": "ok",
            "version": self.updater.agent_version(),
            "controller": self.registration.controller_uri().await,
            "device": self.prober.device(),
            "backoff": self.config.probing.backoff,
            "registered": registered,
            "tracked_jobs": self.prober.jobs.len().await,
            "prober_version": self.updater.installed_version(Component::Prober),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MockHttpFetcher;
    use crate::rpc::MockControllerClient;
    use mockall::predicate::always;
    use std::os::unix::fs::PermissionsExt;
    use vantage_common::{ReceiverMap, RpcFailure, TracerouteTarget};
    use vantage_prober::ProberConfig;

    fn fake_tool(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn test_agent(
        dir: &Path,
        acl: bool,
        client: MockControllerClient,
    ) -> (Arc<Agent>, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let tools = dir.join("tools");
        let out = dir.join("out");
        std::fs::create_dir_all(&tools).unwrap();
        std::fs::create_dir_all(&out).unwrap();

        let mut config = config::create_default_config();
        config.rpc.port = 0;
        config.rpc.acl = acl;
        config.probing.tool_dir = tools.clone();
        config.probing.output_dir = out.clone();
        config.probing.use_sudo = false;
        config.update.install_dir = dir.join("install");

        let prober = Prober::with_device(
            ProberConfig {
                tool_dir: tools,
                output_dir: out,
                threads: 4,
                use_sudo: false,
            },
            "eth0",
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Agent::build(
            config,
            prober,
            Arc::new(MockHttpFetcher::new()),
            Arc::new(client),
            tx,
        )
        .unwrap();
        (agent, rx)
    }

    fn failure(response: RpcResponse) -> RpcFailure {
        match response {
            RpcResponse::Error(failure) => failure,
            other => panic!("意外应答: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_informational_methods() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = test_agent(dir.path(), true, MockControllerClient::new());

        assert_eq!(
            agent.handle(RpcRequest::Version).await,
            RpcResponse::Ok(json!(env!("CARGO_PKG_VERSION")))
        );
        assert_eq!(agent.handle(RpcRequest::Port).await, RpcResponse::Ok(Value::Null));
        assert_eq!(agent.handle(RpcRequest::Uri).await, RpcResponse::Ok(Value::Null));

        let health = agent.health().await;
        assert_eq!(health["device"], "eth0");
        assert_eq!(health["backoff"], true);
        assert_eq!(health["registered"], false);
    }

    #[tokio::test]
    async fn test_register_without_controller_is_typed_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = test_agent(dir.path(), true, MockControllerClient::new());

        let failure = failure(agent.handle(RpcRequest::Register).await);
        assert_eq!(failure.kind, "missing_controller_uri");
        assert!(!agent.server().is_running());
    }

    #[tokio::test]
    async fn test_validation_failures_reach_caller() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = test_agent(dir.path(), true, MockControllerClient::new());

        let mut probes = ReceiverMap::new();
        probes.push("hostA", vec![TracerouteTarget::Bare("1.2.3.4".into())]);
        let spoof_failure = failure(agent.handle(RpcRequest::SpoofTr { probes, id: 2048 }).await);
        assert_eq!(spoof_failure.kind, "out_of_range");

        let results_failure = failure(agent.handle(RpcRequest::GetResults { handle: 999_999 }).await);
        assert_eq!(results_failure.kind, "unknown_handle");
    }

    #[test_log::test(tokio::test)]
    async fn test_launch_and_reap_through_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = test_agent(dir.path(), true, MockControllerClient::new());
        fake_tool(&dir.path().join("tools"), "aliasprobe", "echo \"pong $3\"");

        let response = agent
            .handle(RpcRequest::LaunchPing {
                targets: vec!["10.0.0.1".into()],
            })
            .await;
        let handle = match response {
            RpcResponse::Ok(Value::Number(n)) => n.as_u64().unwrap() as u32,
            other => panic!("意外应答: {:?}", other),
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        match agent.handle(RpcRequest::GetResults { handle }).await {
            RpcResponse::Ok(Value::String(text)) => assert!(text.starts_with("pong")),
            other => panic!("意外应答: {:?}", other),
        }
        let failure = failure(agent.handle(RpcRequest::GetResults { handle }).await);
        assert_eq!(failure.kind, "unknown_handle");
    }

    #[tokio::test]
    async fn test_update_controller_starts_listener_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MockControllerClient::new();
        client
            .expect_register()
            .with(mockall::predicate::eq("http://127.0.0.1:5000"), always())
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_unregister().times(1).returning(|_, _| Ok(()));
        let (agent, _rx) = test_agent(dir.path(), false, client);

        let response = agent
            .handle(RpcRequest::UpdateController {
                uri: "http://127.0.0.1:5000".into(),
            })
            .await;
        assert_eq!(response, RpcResponse::Ok(Value::Null));
        assert!(agent.server().is_running());
        assert_eq!(
            agent.registration_state().await,
            RegistrationState::Registered("http://127.0.0.1:5000".into())
        );
        match agent.handle(RpcRequest::Uri).await {
            RpcResponse::Ok(Value::String(uri)) => assert!(uri.ends_with("/rpc")),
            other => panic!("意外应答: {:?}", other),
        }

        agent.stop_service().await;
        assert!(!agent.server().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, mut rx) = test_agent(dir.path(), true, MockControllerClient::new());

        let response = agent.handle(RpcRequest::Shutdown { code: 3 }).await;
        assert_eq!(response, RpcResponse::Ok(Value::Null));
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(SHUTDOWN_GRACE + Duration::from_millis(10)).await;
        assert_eq!(rx.try_recv().unwrap(), LifecycleEvent::Shutdown(3));
    }
}
