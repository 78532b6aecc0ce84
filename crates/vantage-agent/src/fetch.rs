//! HTTP 拉取
//!
//! 控制器地址发现、探测线程数下发、版本检查与组件下载都是一次简单的 GET。

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Uri};
use serde_yaml::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use vantage_common::{parse_controller_uri, Error, Result};

/// 拉取探测线程数时的尝试次数
const RATE_LIMIT_ATTEMPTS: u32 = 3;

/// 两次尝试之间的等待
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// HTTP 拉取接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// 取回 URL 的响应体
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// 基于 hyper 客户端的实现
pub struct HyperFetcher {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HyperFetcher {
    /// 创建新的拉取器
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl HttpFetcher for HyperFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::Network(format!("URL 无效 {}: {}", url, e)))?;
        debug!("GET {}", url);

        let response = tokio::time::timeout(self.timeout, self.client.get(uri))
            .await
            .map_err(|_| Error::Network(format!("请求 {} 超时", url)))?
            .map_err(|e| Error::Network(format!("请求 {} 失败: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!("{} 返回 {}", url, response.status())));
        }

        let body = tokio::time::timeout(self.timeout, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| Error::Network(format!("读取 {} 超时", url)))?
            .map_err(|e| Error::Network(format!("读取 {} 失败: {}", url, e)))?;
        Ok(body.to_vec())
    }
}

/// 取回文本形式的响应
pub async fn get_text(fetcher: &dyn HttpFetcher, url: &str) -> Result<String> {
    let body = fetcher.get(url).await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// 从发现端点获取当前控制器地址，格式明显不对时返回 `BadControllerUri`
pub async fn discover_controller(fetcher: &dyn HttpFetcher, url: &str) -> Result<String> {
    let body = get_text(fetcher, url).await?;
    let uri = parse_controller_uri(&body)?;
    info!("发现控制器: {}", uri);
    Ok(uri)
}

/// 查询下发给本机的探测线程数
///
/// 端点返回 `主机名: 线程数` 形式的 YAML 映射；最多尝试三次，全部失败或
/// 本机不在表中时返回 `None`。
pub async fn probing_threads_for(fetcher: &dyn HttpFetcher, url: &str, hostname: &str) -> Option<u32> {
    for attempt in 1..=RATE_LIMIT_ATTEMPTS {
        match get_text(fetcher, url).await.and_then(|body| parse_rate_limits(&body)) {
            Ok(limits) => return limits.get(hostname).copied(),
            Err(e) => {
                warn!("获取探测线程数失败 (第 {} 次): {}", attempt, e);
                if attempt < RATE_LIMIT_ATTEMPTS {
                    tokio::time::sleep(RATE_LIMIT_RETRY_DELAY).await;
                }
            }
        }
    }
    None
}

/// 解析 `主机名 -> 线程数` 表，无法识别的条目被忽略
pub fn parse_rate_limits(body: &str) -> Result<HashMap<String, u32>> {
    let table: HashMap<String, Value> = serde_yaml::from_str(body)
        .map_err(|e| Error::Network(format!("线程数表格式错误: {}", e)))?;

    Ok(table
        .into_iter()
        .filter_map(|(host, value)| {
            let threads = match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            threads
                .and_then(|t| u32::try_from(t).ok())
                .map(|t| (host, t))
        })
        .collect())
}
