//! RPC 监听器
//!
//! 同一个监听器提供 `/rpc`（或带随机令牌的私有路径）、`/health` 与
//! `/metrics`。启用访问控制时，不在允许列表中的对端一律得到 403。

use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vantage_common::{Error, Result, RpcFailure, RpcRequest, RpcResponse, RPC_SCHEME};
use vantage_prober::WorkFileAllocator;

use super::{ListenerControl, RpcHandler};
use crate::access::AllowList;
use crate::config::RpcConfig;
use crate::metrics::MetricsCollector;

/// 固定的 RPC 路径
pub const RPC_PATH: &str = "/rpc";

/// 私有路径令牌长度
const TOKEN_LENGTH: usize = 24;

/// M-Lab 节点的域名后缀，这些主机用出口地址代替主机名
const MLAB_DOMAIN: &str = "measurement-lab.org";

/// 用来确定出口地址的外部地址
const TEST_IP: &str = "128.208.2.159";

/// 随机端口回退区间
const FALLBACK_PORT_RANGE: std::ops::Range<u16> = 50000..65000;

/// 等待旧监听器退出的时长
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// 系统主机名
pub fn system_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}

/// 访问外部地址时使用的本机出口地址
pub fn outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect((TEST_IP, 1)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// 写入代理引用的主机部分
pub fn agent_hostname() -> String {
    match system_hostname() {
        Some(name) if name.contains(MLAB_DOMAIN) => outbound_address()
            .map(|ip| ip.to_string())
            .unwrap_or(name),
        Some(name) => name,
        None => outbound_address()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "localhost".to_string()),
    }
}

/// 生成私有路径令牌
pub fn generate_token(length: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn format_agent_ref(hostname: &str, port: u16, path: &str) -> String {
    if hostname.contains(':') {
        format!("{}://[{}]:{}{}", RPC_SCHEME, hostname, port, path)
    } else {
        format!("{}://{}:{}{}", RPC_SCHEME, hostname, port, path)
    }
}

/// 请求处理上下文
struct ServiceContext {
    handler: Weak<dyn RpcHandler>,
    metrics: Arc<MetricsCollector>,
    allow: Option<AllowList>,
    rpc_path: String,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response(status: StatusCode, value: &impl serde::Serialize) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("无法编码应答: {}", e),
        ),
    }
}

impl ServiceContext {
    async fn route(&self, peer: SocketAddr, req: Request<Body>) -> Response<Body> {
        if let Some(allow) = &self.allow {
            if !allow.permits(peer.ip()) {
                warn!("拒绝来自 {} 的连接", peer);
                self.metrics.record_rejected_peer();
                return respond(StatusCode::FORBIDDEN, "text/plain", "Forbidden");
            }
        }

        let Some(handler) = self.handler.upgrade() else {
            return respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "代理正在停止");
        };

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match (&method, path.as_str()) {
            (&Method::GET, "/health") => json_response(StatusCode::OK, &handler.health().await),
            (&Method::GET, "/metrics") => match self.metrics.encode() {
                Ok((content_type, body)) => {
                    let mut response = Response::new(Body::from(body));
                    if let Ok(value) = HeaderValue::from_str(&content_type) {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    error!("导出指标失败: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
                }
            },
            (&Method::POST, path) if path == self.rpc_path.as_str() => {
                let body = match hyper::body::to_bytes(req.into_body()).await {
                    Ok(body) => body,
                    Err(e) => {
                        let failure = RpcFailure::from(&Error::Rpc(format!("读取请求失败: {}", e)));
                        return json_response(StatusCode::BAD_REQUEST, &RpcResponse::Error(failure));
                    }
                };
                match serde_json::from_slice::<RpcRequest>(&body) {
                    Ok(request) => {
                        debug!("来自 {} 的调用: {}", peer, request.method());
                        json_response(StatusCode::OK, &handler.handle(request).await)
                    }
                    Err(e) => {
                        self.metrics.record_error("json");
                        let failure = RpcFailure::from(&Error::Json(e));
                        json_response(StatusCode::BAD_REQUEST, &RpcResponse::Error(failure))
                    }
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        }
    }
}

/// 正在运行的监听器
struct RunningListener {
    addr: SocketAddr,
    hostname: String,
    agent_ref: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// RPC 服务
pub struct RpcServer {
    config: RpcConfig,
    handler: Weak<dyn RpcHandler>,
    metrics: Arc<MetricsCollector>,
    allocator: Arc<WorkFileAllocator>,
    running: Mutex<Option<RunningListener>>,
}

impl RpcServer {
    /// 创建新的 RPC 服务，调用在 `handler` 上分派
    pub fn new(
        config: RpcConfig,
        handler: Weak<dyn RpcHandler>,
        metrics: Arc<MetricsCollector>,
        allocator: Arc<WorkFileAllocator>,
    ) -> Self {
        Self {
            config,
            handler,
            metrics,
            allocator,
            running: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RunningListener>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 监听端口
    pub fn port(&self) -> Option<u16> {
        self.lock().as_ref().map(|running| running.addr.port())
    }

    /// 监听地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|running| running.addr)
    }

    /// 代理引用中的主机名；未监听时即时计算
    pub fn hostname(&self) -> String {
        self.lock()
            .as_ref()
            .map(|running| running.hostname.clone())
            .unwrap_or_else(agent_hostname)
    }

    /// 依次尝试配置端口、系统分配端口与随机高位端口
    fn bind(&self) -> Result<hyper::server::Builder<hyper::server::conn::AddrIncoming>> {
        let configured = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        match Server::try_bind(&configured) {
            Ok(builder) => return Ok(builder),
            Err(e) => warn!("无法监听 {}: {}，改用系统分配端口", configured, e),
        }

        let ephemeral = SocketAddr::from(([0, 0, 0, 0], 0));
        match Server::try_bind(&ephemeral) {
            Ok(builder) => return Ok(builder),
            Err(e) => warn!("无法监听系统分配端口: {}，改用随机端口", e),
        }

        let random = SocketAddr::from(([0, 0, 0, 0], thread_rng().gen_range(FALLBACK_PORT_RANGE)));
        Server::try_bind(&random).map_err(|e| Error::Rpc(format!("无法监听 {}: {}", random, e)))
    }
}

#[async_trait]
impl ListenerControl for RpcServer {
    fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    async fn start(&self, allow: Option<AllowList>) -> Result<String> {
        if let Some(agent_ref) = self.agent_ref() {
            return Ok(agent_ref);
        }

        let rpc_path = if self.config.front {
            RPC_PATH.to_string()
        } else {
            format!("{}/{}", RPC_PATH, generate_token(TOKEN_LENGTH))
        };
        let context = Arc::new(ServiceContext {
            handler: self.handler.clone(),
            metrics: self.metrics.clone(),
            allow,
            rpc_path: rpc_path.clone(),
        });

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let context = context.clone();
            let peer = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let context = context.clone();
                    async move { Ok::<_, Infallible>(context.route(peer, req).await) }
                }))
            }
        });

        let server = self.bind()?.serve(make_svc);
        let addr = server.local_addr();
        let (shutdown, signal) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            let _ = signal.await;
        });
        let task = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                error!("RPC 服务错误: {}", e);
            }
        });

        let hostname = agent_hostname();
        let agent_ref = format_agent_ref(&hostname, addr.port(), &rpc_path);
        self.allocator.set_port(addr.port());
        info!("RPC 服务启动在 {}", agent_ref);

        let mut running = self.lock();
        if running.is_some() {
            // 并发启动时保留先完成的一个
            let _ = shutdown.send(());
            return Ok(running
                .as_ref()
                .map(|r| r.agent_ref.clone())
                .unwrap_or(agent_ref));
        }
        *running = Some(RunningListener {
            addr,
            hostname,
            agent_ref: agent_ref.clone(),
            shutdown,
            task,
        });
        Ok(agent_ref)
    }

    async fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };
        info!("停止 RPC 服务 {}", running.agent_ref);
        let _ = running.shutdown.send(());
        if tokio::time::timeout(STOP_TIMEOUT, running.task).await.is_err() {
            debug!("RPC 服务仍在处理进行中的请求");
        }
    }

    fn agent_ref(&self) -> Option<String> {
        self.lock().as_ref().map(|running| running.agent_ref.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Client;
    use serde_json::json;

    #[test]
    fn test_system_hostname_matches_kernel() {
        let kernel = std::fs::read_to_string("/proc/sys/kernel/hostname").unwrap();
        assert_eq!(system_hostname().as_deref(), Some(kernel.trim()));
        assert!(!agent_hostname().is_empty());
    }

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::GetResults { handle } => {
                    RpcResponse::from_result::<()>(Err(Error::UnknownHandle(handle)))
                }
                other => RpcResponse::from_result(Ok(other.method())),
            }
        }

        async fn health(&self) -> serde_json::Value {
            json!({"status": "ok"})
        }
    }

    fn server(handler: &Arc<dyn RpcHandler>, front: bool) -> RpcServer {
        let dir = std::env::temp_dir();
        RpcServer::new(
            RpcConfig {
                port: 0,
                acl: false,
                front,
            },
            Arc::downgrade(handler),
            Arc::new(MetricsCollector::new().unwrap()),
            Arc::new(WorkFileAllocator::new(dir)),
        )
    }

    async fn post(url: &str, body: &str) -> (StatusCode, String) {
        let req = Request::builder()
            .method(Method::POST)
            .uri(url)
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = Client::new().request(req).await.unwrap();
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn local_url(server: &RpcServer, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", server.port().unwrap(), path)
    }

    #[tokio::test]
    async fn test_dispatch_and_errors() {
        let handler: Arc<dyn RpcHandler> = Arc::new(EchoHandler);
        let server = server(&handler, true);
        let agent_ref = server.start(None).await.unwrap();
        assert!(agent_ref.ends_with(&format!(":{}/rpc", server.port().unwrap())));
        assert!(server.is_running());

        let url = local_url(&server, "/rpc");
        let (status, body) = post(&url, r#"{"method":"version"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"ok":"version"}"#);

        let (_, body) = post(&url, r#"{"method":"get_results","params":{"handle":7}}"#).await;
        assert!(body.contains(r#""kind":"unknown_handle""#));

        let (status, body) = post(&url, "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains(r#""kind":"json""#));

        server.stop().await;
        assert!(!server.is_running());
        assert!(server.agent_ref().is_none());
    }

    #[tokio::test]
    async fn test_private_path_when_not_fronted() {
        let handler: Arc<dyn RpcHandler> = Arc::new(EchoHandler);
        let server = server(&handler, false);
        let agent_ref = server.start(None).await.unwrap();
        let path = agent_ref.split_once("/rpc/").map(|(_, token)| token).unwrap();
        assert_eq!(path.len(), TOKEN_LENGTH);

        let (status, _) = post(&local_url(&server, "/rpc"), r#"{"method":"version"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let private = format!("/rpc/{}", path);
        let (status, _) = post(&local_url(&server, &private), r#"{"method":"version"}"#).await;
        assert_eq!(status, StatusCode::OK);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_acl_rejects_non_allowed_peer() {
        let handler: Arc<dyn RpcHandler> = Arc::new(EchoHandler);
        let server = server(&handler, true);
        let allow = AllowList::from_addrs(["192.0.2.1".parse().unwrap()]);
        server.start(Some(allow)).await.unwrap();

        // 回环地址总是放行
        let (status, _) = post(&local_url(&server, "/rpc"), r#"{"method":"version"}"#).await;
        assert_eq!(status, StatusCode::OK);

        let context = ServiceContext {
            handler: Arc::downgrade(&handler),
            metrics: Arc::new(MetricsCollector::new().unwrap()),
            allow: Some(AllowList::loopback_only()),
            rpc_path: RPC_PATH.to_string(),
        };
        let req = Request::builder()
            .method(Method::POST)
            .uri("/rpc")
            .body(Body::from(r#"{"method":"version"}"#))
            .unwrap();
        let resp = context.route("198.51.100.9:40000".parse().unwrap(), req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let handler: Arc<dyn RpcHandler> = Arc::new(EchoHandler);
        let server = server(&handler, true);
        server.start(None).await.unwrap();

        let client = Client::new();
        let resp = client
            .get(local_url(&server, "/health").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);

        let resp = client
            .get(local_url(&server, "/metrics").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        server.stop().await;
    }

    #[test]
    fn test_agent_ref_format() {
        assert_eq!(format_agent_ref("vp1", 54321, "/rpc"), "http://vp1:54321/rpc");
        assert_eq!(format_agent_ref("::1", 80, "/rpc"), "http://[::1]:80/rpc");
        assert_ne!(generate_token(8), generate_token(8));
    }
}
