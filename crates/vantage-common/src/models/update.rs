//! 自更新组件模型

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// 可独立更新的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// 探测工具包
    Prober,
    /// 代理本身
    Agent,
    /// 代理配置
    Config,
}

impl Component {
    /// 更新循环的检查顺序
    pub const ALL: [Component; 3] = [Component::Prober, Component::Agent, Component::Config];

    /// 更新后是否需要整体重启
    pub fn restart_required(&self) -> bool {
        match self {
            Component::Prober => false,
            Component::Agent | Component::Config => true,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Prober => write!(f, "prober"),
            Component::Agent => write!(f, "agent"),
            Component::Config => write!(f, "config"),
        }
    }
}

impl FromStr for Component {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "prober" => Ok(Component::Prober),
            "agent" | "vp" => Ok(Component::Agent),
            "config" | "vp_config" => Ok(Component::Config),
            _ => Err(Error::Config(format!("无效的组件: {}", s))),
        }
    }
}

/// 已发布版本号
///
/// 版本号之间只比较相等与否：CVS 风格的 1.2 与 1.11 无法用简单大小比较排序。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// 由已知合法的字符串创建
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// 解析版本端点返回的内容
    ///
    /// 取第一个空白分隔的字段原样保存。字段的数值前缀（如 `0.1.0` 的 `0.1`）
    /// 缺失或为零时视为无效，返回 `None`。
    pub fn parse_published(body: &str) -> Option<Self> {
        let token = body.split_whitespace().next()?;
        if numeric_prefix(token) == 0.0 {
            return None;
        }
        Some(Self(token.to_string()))
    }

    /// 字符串形式
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 字符串开头的十进制数值，没有数字时为零
fn numeric_prefix(token: &str) -> f64 {
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in token.char_indices() {
        match c {
            '0'..='9' => end = i + 1,
            '.' if !seen_dot => seen_dot = true,
            _ => break,
        }
    }
    token[..end].parse().unwrap_or(0.0)
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_published_version() {
        assert_eq!(Version::parse_published("1.82\n"), Some(Version::new("1.82")));
        assert_eq!(Version::parse_published("  1.11 extra"), Some(Version::new("1.11")));
        assert_eq!(Version::parse_published("0"), None);
        assert_eq!(Version::parse_published("0.0"), None);
        assert_eq!(Version::parse_published("<html>"), None);
        assert_eq!(Version::parse_published(""), None);
    }

    #[test]
    fn test_parse_semver_version() {
        assert_eq!(Version::parse_published("0.1.0\n"), Some(Version::new("0.1.0")));
        assert_eq!(Version::parse_published("2.0.1-rc1"), Some(Version::new("2.0.1-rc1")));
        assert_eq!(Version::parse_published("0.0.0"), None);
        assert_eq!(Version::parse_published(".5"), Some(Version::new(".5")));
    }

    #[test]
    fn test_restart_requirements() {
        assert!(!Component::Prober.restart_required());
        assert!(Component::Agent.restart_required());
        assert!(Component::Config.restart_required());
        assert_eq!("vp".parse::<Component>().unwrap(), Component::Agent);
    }
}
