//! RPC 层
//!
//! JSON over HTTP：代理在监听器上接受控制器的调用，同时作为客户端向控制器
//! 注册与注销。

mod client;
mod server;

pub use client::*;
pub use server::*;

use async_trait::async_trait;

use vantage_common::{Result, RpcRequest, RpcResponse};

use crate::access::AllowList;

/// 处理进入的 RPC 调用
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// 分派一次调用
    async fn handle(&self, request: RpcRequest) -> RpcResponse;

    /// 健康状态
    async fn health(&self) -> serde_json::Value;
}

/// 监听器的启停控制
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListenerControl: Send + Sync {
    /// 是否正在监听
    fn is_running(&self) -> bool;

    /// 启动监听，`allow` 为空时不做访问控制；返回代理引用
    async fn start(&self, allow: Option<AllowList>) -> Result<String>;

    /// 停止监听
    async fn stop(&self);

    /// 控制器回调代理所用的引用，未监听时为空
    fn agent_ref(&self) -> Option<String>;
}

/// 代理调用控制器的接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// 向控制器注册
    async fn register(&self, controller_uri: &str, agent_ref: &str) -> Result<()>;

    /// 从控制器注销
    async fn unregister(&self, controller_uri: &str, agent_ref: &str) -> Result<()>;
}
