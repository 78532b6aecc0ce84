//! RPC 报文模型
//!
//! 请求体为 `{"method": ..., "params": {...}}`，应答为 `{"ok": ...}` 或
//! `{"error": {"kind": ..., "message": ...}}`。代理暴露给控制器的方法与
//! 控制器暴露给代理的方法共用同一套信封。

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::probe::{JobHandle, TimestampProbe};
use crate::models::spoof::{ReceiverMap, TracerouteTarget, DEFAULT_SESSION_ID};
use crate::models::update::Component;

fn default_session_id() -> u32 {
    DEFAULT_SESSION_ID
}

/// 控制器可以调用的代理方法
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    /// 向当前控制器注册
    Register,
    /// 从当前控制器注销
    Unregister,
    /// 切换控制器
    UpdateController { uri: String },
    /// 宽限期后退出进程
    Shutdown {
        #[serde(default)]
        code: i32,
    },
    /// 同步 traceroute
    Traceroute { targets: Vec<String> },
    /// 同步 ping
    Ping { targets: Vec<String> },
    /// 同步 record route
    Rr { targets: Vec<String> },
    /// 同步时间戳探测
    Ts { probes: Vec<TimestampProbe> },
    /// Paris traceroute
    ParisTraceroute { target: String },
    /// 异步 traceroute
    LaunchTraceroute { targets: Vec<String> },
    /// 异步 ping
    LaunchPing { targets: Vec<String> },
    /// 异步 record route
    LaunchRr { targets: Vec<String> },
    /// 异步时间戳探测
    LaunchTs { probes: Vec<TimestampProbe> },
    /// 收取异步作业结果
    GetResults { handle: JobHandle },
    /// 发送欺骗 record route
    SpoofRr {
        probes: ReceiverMap<String>,
        #[serde(default = "default_session_id")]
        id: u32,
    },
    /// 发送欺骗时间戳探测
    SpoofTs {
        probes: ReceiverMap<TimestampProbe>,
        #[serde(default = "default_session_id")]
        id: u32,
    },
    /// 发送欺骗 traceroute
    SpoofTr {
        probes: ReceiverMap<TracerouteTarget>,
        id: i64,
    },
    /// 启动 record route 接收端
    ReceiveSpoofedRr {
        #[serde(default = "default_session_id")]
        id: u32,
    },
    /// 启动时间戳接收端
    ReceiveSpoofedTs {
        #[serde(default = "default_session_id")]
        id: u32,
    },
    /// 终止接收端并取回结果
    KillAndRetrieve {
        path: String,
        #[serde(default = "default_session_id")]
        id: u32,
    },
    /// 检查组件更新
    CheckForUpdate {
        #[serde(default = "default_component")]
        component: Component,
    },
    /// 版本号
    Version,
    /// 主机名
    Hostname,
    /// 监听端口
    Port,
    /// 服务 URI
    Uri,
}

fn default_component() -> Component {
    Component::Agent
}

impl RpcRequest {
    /// 方法名，用于日志
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Register => "register",
            RpcRequest::Unregister => "unregister",
            RpcRequest::UpdateController { .. } => "update_controller",
            RpcRequest::Shutdown { .. } => "shutdown",
            RpcRequest::Traceroute { .. } => "traceroute",
            RpcRequest::Ping { .. } => "ping",
            RpcRequest::Rr { .. } => "rr",
            RpcRequest::Ts { .. } => "ts",
            RpcRequest::ParisTraceroute { .. } => "paris_traceroute",
            RpcRequest::LaunchTraceroute { .. } => "launch_traceroute",
            RpcRequest::LaunchPing { .. } => "launch_ping",
            RpcRequest::LaunchRr { .. } => "launch_rr",
            RpcRequest::LaunchTs { .. } => "launch_ts",
            RpcRequest::GetResults { .. } => "get_results",
            RpcRequest::SpoofRr { .. } => "spoof_rr",
            RpcRequest::SpoofTs { .. } => "spoof_ts",
            RpcRequest::SpoofTr { .. } => "spoof_tr",
            RpcRequest::ReceiveSpoofedRr { .. } => "receive_spoofed_rr",
            RpcRequest::ReceiveSpoofedTs { .. } => "receive_spoofed_ts",
            RpcRequest::KillAndRetrieve { .. } => "kill_and_retrieve",
            RpcRequest::CheckForUpdate { .. } => "check_for_update",
            RpcRequest::Version => "version",
            RpcRequest::Hostname => "hostname",
            RpcRequest::Port => "port",
            RpcRequest::Uri => "uri",
        }
    }
}

/// 代理可以调用的控制器方法
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ControllerRequest {
    /// 注册代理，`agent` 为控制器回调代理所用的引用
    Register { agent: String },
    /// 注销代理
    Unregister { agent: String },
}

/// 失败应答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    /// 错误分类标签
    pub kind: String,
    /// 可读信息
    pub message: String,
}

impl From<&Error> for RpcFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// RPC 应答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcResponse {
    /// 成功
    Ok(serde_json::Value),
    /// 失败
    Error(RpcFailure),
}

impl RpcResponse {
    /// 由调用结果构造应答
    pub fn from_result<T: Serialize>(result: crate::Result<T>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(Error::from)) {
            Ok(value) => RpcResponse::Ok(value),
            Err(err) => RpcResponse::Error(RpcFailure::from(&err)),
        }
    }
}
