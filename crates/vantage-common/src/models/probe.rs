//! 探测种类模型
//!
//! 定义同步/异步探测支持的种类，以及时间戳探测的单行规格。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// 异步作业句柄（即探测子进程的 pid）
pub type JobHandle = u32;

/// 探测种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// 路由跟踪
    Traceroute,
    /// 别名探测 ping
    Ping,
    /// Record Route 选项探测
    Rr,
    /// 预设时间戳选项探测
    Ts,
}

impl ProbeKind {
    /// 全部探测种类
    pub const ALL: [ProbeKind; 4] = [
        ProbeKind::Traceroute,
        ProbeKind::Ping,
        ProbeKind::Rr,
        ProbeKind::Ts,
    ];

    /// 对应的外部探测工具名
    pub fn tool(&self) -> &'static str {
        match self {
            ProbeKind::Traceroute => "randstprober",
            ProbeKind::Ping => "aliasprobe",
            ProbeKind::Rr => "rrping",
            ProbeKind::Ts => "tsprespec-ping",
        }
    }

    /// 工具是否把结果写到标准输出（否则写到旁路输出文件）
    pub fn writes_stdout(&self) -> bool {
        matches!(self, ProbeKind::Ping | ProbeKind::Ts)
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Traceroute => write!(f, "traceroute"),
            ProbeKind::Ping => write!(f, "ping"),
            ProbeKind::Rr => write!(f, "rr"),
            ProbeKind::Ts => write!(f, "ts"),
        }
    }
}

impl FromStr for ProbeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "traceroute" => Ok(ProbeKind::Traceroute),
            "ping" => Ok(ProbeKind::Ping),
            "rr" => Ok(ProbeKind::Rr),
            "ts" => Ok(ProbeKind::Ts),
            _ => Err(Error::Config(format!("无效的探测种类: {}", s))),
        }
    }
}

/// 时间戳探测规格：目标地址后跟若干预设时间戳槽位
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampProbe(pub Vec<String>);

impl TimestampProbe {
    /// 由目标和槽位构造
    pub fn new<I, S>(target: &str, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = vec![target.to_string()];
        fields.extend(slots.into_iter().map(Into::into));
        Self(fields)
    }

    /// 探测目标
    pub fn target(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// 写入工作文件的一行（空格分隔）
    pub fn line(&self) -> String {
        self.0.join(" ")
    }
}

/// 探测目标：同步和异步的简单探测都接收一组目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeTargets {
    /// 每行一个目标（traceroute/ping/rr）
    Hosts(Vec<String>),
    /// 每行一个时间戳规格（ts）
    Timestamps(Vec<TimestampProbe>),
}

impl ProbeTargets {
    /// 目标数量
    pub fn len(&self) -> usize {
        match self {
            ProbeTargets::Hosts(hosts) => hosts.len(),
            ProbeTargets::Timestamps(probes) => probes.len(),
        }
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 工作文件中的各行
    pub fn lines(&self) -> Vec<String> {
        match self {
            ProbeTargets::Hosts(hosts) => hosts.clone(),
            ProbeTargets::Timestamps(probes) => probes.iter().map(TimestampProbe::line).collect(),
        }
    }
}
