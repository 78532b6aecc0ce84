//! 控制器客户端

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use std::time::Duration;
use tracing::{debug, info};

use vantage_common::{ControllerRequest, Error, Result, RpcResponse};

use super::ControllerClient;

/// 控制器上的 RPC 路径
pub const CONTROLLER_RPC_PATH: &str = "/rpc";

/// 基于 HTTP 的控制器客户端
pub struct HttpControllerClient {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HttpControllerClient {
    /// 创建新的客户端
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// 控制器 RPC 端点
    pub fn endpoint(controller_uri: &str) -> String {
        format!("{}{}", controller_uri.trim().trim_end_matches('/'), CONTROLLER_RPC_PATH)
    }

    async fn call(&self, controller_uri: &str, request: &ControllerRequest) -> Result<()> {
        let endpoint = Self::endpoint(controller_uri);
        let body = serde_json::to_vec(request)?;
        let http_request = Request::builder()
            .method(Method::POST)
            .uri(endpoint.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|e| Error::BadControllerUri(format!("{}: {}", endpoint, e)))?;
        debug!("调用控制器 {}: {:?}", endpoint, request);

        let response = tokio::time::timeout(self.timeout, self.client.request(http_request))
            .await
            .map_err(|_| Error::Network(format!("调用 {} 超时", endpoint)))?
            .map_err(|e| Error::Network(format!("调用 {} 失败: {}", endpoint, e)))?;
        let status = response.status();
        let bytes = tokio::time::timeout(self.timeout, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| Error::Network(format!("读取 {} 应答超时", endpoint)))?
            .map_err(|e| Error::Network(format!("读取 {} 应答失败: {}", endpoint, e)))?;

        match serde_json::from_slice::<RpcResponse>(&bytes) {
            Ok(RpcResponse::Ok(_)) => Ok(()),
            Ok(RpcResponse::Error(failure)) => Err(Error::Rpc(format!(
                "控制器拒绝 ({}): {}",
                failure.kind, failure.message
            ))),
            Err(e) => Err(Error::Rpc(format!("控制器应答无法解析 ({}): {}", status, e))),
        }
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn register(&self, controller_uri: &str, agent_ref: &str) -> Result<()> {
        self.call(
            controller_uri,
            &ControllerRequest::Register {
                agent: agent_ref.to_string(),
            },
        )
        .await?;
        info!("已向 {} 注册 {}", controller_uri, agent_ref);
        Ok(())
    }

    async fn unregister(&self, controller_uri: &str, agent_ref: &str) -> Result<()> {
        self.call(
            controller_uri,
            &ControllerRequest::Unregister {
                agent: agent_ref.to_string(),
            },
        )
        .await?;
        info!("已从 {} 注销 {}", controller_uri, agent_ref);
        Ok(())
    }
}
