//! 探测网卡选择
//!
//! 根据 `/proc/net/dev` 中的收包计数选择流量最大的 `eth*` 网卡，
//! 读不到统计信息或没有合格网卡时退回 `eth0`。

use std::path::PathBuf;
use tracing::{debug, warn};

/// 默认网卡
pub const DEFAULT_DEVICE: &str = "eth0";

/// 网卡统计来源
const NET_DEV_PATH: &str = "/proc/net/dev";

/// 网卡选择器
pub struct DeviceSelector {
    /// 统计文件路径
    source: PathBuf,
}

impl DeviceSelector {
    /// 使用指定统计文件创建选择器
    pub fn with_source(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// 选择网卡，任何失败都静默退回默认值
    pub fn select(&self) -> String {
        match std::fs::read_to_string(&self.source) {
            Ok(stats) => {
                let device = Self::select_from(&stats);
                debug!("选择探测网卡: {}", device);
                device
            }
            Err(e) => {
                warn!("无法读取网卡统计 {:?}: {}，使用 {}", self.source, e, DEFAULT_DEVICE);
                DEFAULT_DEVICE.to_string()
            }
        }
    }

    /// 从统计文本中选出收包数最多的 `eth*` 网卡
    pub fn select_from(stats: &str) -> String {
        let mut device = DEFAULT_DEVICE.to_string();
        let mut current_packets = 0u64;

        for line in stats.lines() {
            let Some((name, counters)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if !name.starts_with("eth") {
                continue;
            }
            // 冒号后第二列为收包数
            let packets = counters
                .split_whitespace()
                .nth(1)
                .and_then(|field| field.parse::<u64>().ok())
                .unwrap_or(0);
            if packets > current_packets {
                device = name.to_string();
                current_packets = packets;
            }
        }

        device
    }
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::with_source(NET_DEV_PATH)
    }
}
