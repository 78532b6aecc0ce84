//! 错误处理模块
//!
//! 该模块提供探测代理的统一错误类型。远程调用方看到的每一种失败都对应这里的
//! 一个变体，`Error::kind` 给出在线路上传输的稳定标签。

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 探测代理统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 欺骗会话 ID 或 TTL 超出取值范围
    #[error("取值超出范围: {value} 不在 ({min}..{max}) 内")]
    OutOfRange {
        /// 下界
        min: i64,
        /// 上界
        max: i64,
        /// 实际值
        value: i64,
    },

    /// 查询结果时使用了未被跟踪的作业句柄
    #[error("未知的作业句柄: {0}")]
    UnknownHandle(u32),

    /// 探测工具没有生成预期的输出文件
    #[error("缺少结果文件: {}", .0.display())]
    MissingResultFile(PathBuf),

    /// 注册时不知道控制器地址
    #[error("缺少控制器 URI")]
    MissingControllerUri,

    /// 控制器地址格式不正确
    #[error("控制器 URI 无效: {0}")]
    BadControllerUri(String),

    /// 网络错误（版本检查、控制器发现、源码下载）
    #[error("网络错误: {0}")]
    Network(String),

    /// RPC 层错误
    #[error("RPC 错误: {0}")]
    Rpc(String),

    /// 子进程调用失败
    #[error("子进程错误: {0}")]
    Subprocess(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 自更新失败
    #[error("更新错误: {0}")]
    Update(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// 探测代理结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 构造范围错误
    pub fn out_of_range(min: i64, max: i64, value: i64) -> Self {
        Error::OutOfRange { min, max, value }
    }

    /// 错误分类标签，随 RPC 失败应答一起返回给调用方
    pub fn kind(&self) -> &'static str {
        match self {
            Error::OutOfRange { .. } => "out_of_range",
            Error::UnknownHandle(_) => "unknown_handle",
            Error::MissingResultFile(_) => "missing_result_file",
            Error::MissingControllerUri => "missing_controller_uri",
            Error::BadControllerUri(_) => "bad_controller_uri",
            Error::Network(_) => "network",
            Error::Rpc(_) => "rpc",
            Error::Subprocess(_) => "subprocess",
            Error::Config(_) => "config",
            Error::Update(_) => "update",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    /// 是否属于可重试的瞬时故障
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Rpc(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = Error::out_of_range(0, 2047, 2048);
        assert_eq!(err.kind(), "out_of_range");
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("2047"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("超时".into()).is_transient());
        assert!(!Error::UnknownHandle(7).is_transient());
        assert!(!Error::MissingControllerUri.is_transient());
    }
}
