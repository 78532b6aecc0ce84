//! 控制器与代理 URI 工具函数

use url::Url;

use crate::error::{Error, Result};

/// RPC 层使用的 URI scheme
pub const RPC_SCHEME: &str = "http";

fn parse(uri: &str) -> Result<Url> {
    Url::parse(uri.trim()).map_err(|e| Error::BadControllerUri(format!("{}: {}", uri.trim(), e)))
}

/// 提取 URI 的主机部分
pub fn uri_host(uri: &str) -> Result<String> {
    let url = parse(uri)?;
    url.host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| Error::BadControllerUri(format!("缺少主机: {}", uri.trim())))
}

/// 校验从发现端点取回的控制器 URI
pub fn parse_controller_uri(body: &str) -> Result<String> {
    let uri = body.trim();
    let url = parse(uri)?;
    if url.scheme() != RPC_SCHEME {
        return Err(Error::BadControllerUri(format!("scheme 无效: {}", uri)));
    }
    if url.host_str().is_none() {
        return Err(Error::BadControllerUri(format!("缺少主机: {}", uri)));
    }
    Ok(uri.to_string())
}

/// 两个 URI 是否指向同一主机；任一无法解析时视为不同
pub fn same_host(a: &str, b: &str) -> bool {
    match (uri_host(a), uri_host(b)) {
        (Ok(a), Ok(b)) => a.eq_ignore_ascii_case(&b),
        _ => false,
    }
}
