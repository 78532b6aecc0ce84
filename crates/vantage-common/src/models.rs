//! 数据模型模块
//!
//! 包含探测种类、欺骗探测会话、组件更新、RPC 报文等所有组件共享的数据结构。

pub mod probe;
pub mod rpc;
pub mod spoof;
pub mod update;
pub mod uri;
