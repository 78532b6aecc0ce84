//! Vantage Common - 跨模块共享工具与数据结构
//!
//! 该模块提供探测代理中所有组件共享的数据结构与统一的错误处理机制，
//! 包括探测种类、欺骗会话与 TTL 校验、RPC 报文格式以及控制器 URI 工具函数。

pub mod error;
pub mod models;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::probe::*;
pub use models::rpc::*;
pub use models::spoof::*;
pub use models::update::*;
pub use models::uri::*;
