//! 欺骗探测模型
//!
//! 欺骗探测分为发送端和接收端两段，二者通过嵌入每个报文中的会话 ID 关联。
//! 本模块定义会话 ID、TTL 区间的校验规则，以及按接收者分组的目标表。

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

use crate::error::{Error, Result};

/// rr/ts 欺骗探测未指定会话 ID 时使用的默认值
pub const DEFAULT_SESSION_ID: u32 = 45678;

/// 欺骗 traceroute 会话 ID 上界（11 位字段）
pub const MAX_SPOOF_ID: i64 = 2047;

/// 默认起始 TTL
pub const DEFAULT_START_TTL: i64 = 1;

/// 默认结束 TTL
pub const DEFAULT_FINISH_TTL: i64 = 30;

/// 结束 TTL 的上界
pub const MAX_TTL: i64 = 31;

/// 欺骗探测种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpoofKind {
    /// Record Route
    Rr,
    /// 时间戳
    Ts,
}

impl SpoofKind {
    /// 发送端工具名
    pub fn send_tool(&self) -> &'static str {
        match self {
            SpoofKind::Rr => "rrspoof",
            SpoofKind::Ts => "tsprespec-spoof",
        }
    }

    /// 接收端工具前缀，实际程序为 `<prefix>-recv`
    pub fn receiver_prefix(&self) -> &'static str {
        match self {
            SpoofKind::Rr => "rrspoof",
            SpoofKind::Ts => "tsprespec",
        }
    }

    /// 接收端工具名
    pub fn receiver_tool(&self) -> String {
        format!("{}-recv", self.receiver_prefix())
    }
}

impl fmt::Display for SpoofKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpoofKind::Rr => write!(f, "rr"),
            SpoofKind::Ts => write!(f, "ts"),
        }
    }
}

/// 欺骗会话
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpoofSession {
    /// 会话 ID
    pub id: u32,
    /// 种类
    pub kind: SpoofKind,
}

impl SpoofSession {
    /// 创建会话
    pub fn new(kind: SpoofKind, id: u32) -> Self {
        Self { id, kind }
    }
}

/// 校验欺骗 traceroute 的会话 ID，必须落在 `[0, 2047]`
pub fn validate_spoof_id(id: i64) -> Result<u16> {
    if !(0..=MAX_SPOOF_ID).contains(&id) {
        return Err(Error::out_of_range(0, MAX_SPOOF_ID, id));
    }
    Ok(id as u16)
}

/// TTL 区间，满足 `1 <= start <= finish <= 31`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TtlRange {
    /// 起始 TTL
    pub start: u8,
    /// 结束 TTL（含）
    pub finish: u8,
}

impl TtlRange {
    /// 校验并创建 TTL 区间
    pub fn new(start: i64, finish: i64) -> Result<Self> {
        if start < 1 || start > finish {
            return Err(Error::out_of_range(1, finish, start));
        }
        if finish > MAX_TTL {
            return Err(Error::out_of_range(start, MAX_TTL, finish));
        }
        Ok(Self {
            start: start as u8,
            finish: finish as u8,
        })
    }

    /// 区间内的全部 TTL
    pub fn ttls(&self) -> impl Iterator<Item = u8> {
        self.start..=self.finish
    }
}

impl Default for TtlRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_START_TTL as u8,
            finish: DEFAULT_FINISH_TTL as u8,
        }
    }
}

/// 欺骗 traceroute 目标
///
/// 线路上可以是 `"dst"`、`["dst"]`、`["dst", start]` 或 `["dst", start, finish]`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TracerouteTarget {
    /// 仅目标
    Bare(String),
    /// 单元素数组
    Destination((String,)),
    /// 指定起始 TTL
    WithStart((String, i64)),
    /// 指定起止 TTL
    WithRange((String, i64, i64)),
}

impl TracerouteTarget {
    /// 目标地址
    pub fn destination(&self) -> &str {
        match self {
            TracerouteTarget::Bare(dst)
            | TracerouteTarget::Destination((dst,))
            | TracerouteTarget::WithStart((dst, _))
            | TracerouteTarget::WithRange((dst, _, _)) => dst,
        }
    }

    /// 补齐默认值后校验 TTL 区间
    pub fn ttl_range(&self) -> Result<TtlRange> {
        match self {
            TracerouteTarget::Bare(_) | TracerouteTarget::Destination(_) => {
                TtlRange::new(DEFAULT_START_TTL, DEFAULT_FINISH_TTL)
            }
            TracerouteTarget::WithStart((_, start)) => TtlRange::new(*start, DEFAULT_FINISH_TTL),
            TracerouteTarget::WithRange((_, start, finish)) => TtlRange::new(*start, *finish),
        }
    }
}

/// 按接收者分组的目标表
///
/// 线路上是 JSON 对象，但内部始终保持为有序列表并按列表顺序遍历：
/// 某些接收主机在按映射遍历时会发起指向自身的调用，顺序必须保留。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverMap<T>(Vec<(String, Vec<T>)>);

impl<T> ReceiverMap<T> {
    /// 空表
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// 追加一个接收者
    pub fn push(&mut self, receiver: impl Into<String>, targets: Vec<T>) {
        self.0.push((receiver.into(), targets));
    }

    /// 接收者列表，按插入顺序
    pub fn receivers(&self) -> Vec<&str> {
        self.0.iter().map(|(receiver, _)| receiver.as_str()).collect()
    }

    /// 按插入顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[T])> {
        self.0
            .iter()
            .map(|(receiver, targets)| (receiver.as_str(), targets.as_slice()))
    }

    /// 全部目标数量
    pub fn target_count(&self) -> usize {
        self.0.iter().map(|(_, targets)| targets.len()).sum()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Default for ReceiverMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<Vec<(String, Vec<T>)>> for ReceiverMap<T> {
    fn from(entries: Vec<(String, Vec<T>)>) -> Self {
        Self(entries)
    }
}

impl<T: Serialize> Serialize for ReceiverMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (receiver, targets) in &self.0 {
            map.serialize_entry(receiver, targets)?;
        }
        map.end()
    }
}

struct ReceiverMapVisitor<T>(PhantomData<T>);

impl<'de, T: Deserialize<'de>> Visitor<'de> for ReceiverMapVisitor<T> {
    type Value = ReceiverMap<T>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "接收者到目标列表的映射")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((receiver, targets)) = access.next_entry::<String, Vec<T>>()? {
            entries.push((receiver, targets));
        }
        Ok(ReceiverMap(entries))
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for ReceiverMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(ReceiverMapVisitor(PhantomData))
    }
}

/// 接收端收集到的欺骗探测结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoofResults {
    /// 探测结果原文
    pub probes: String,
    /// 被欺骗的源主机名，每行一个
    pub sources: Vec<String>,
    /// 工具可选输出的 TTL 旁路文件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, true)]
    #[case(100, true)]
    #[case(2047, true)]
    #[case(-1, false)]
    #[case(2048, false)]
    fn test_validate_spoof_id(#[case] id: i64, #[case] accepted: bool) {
        let result = validate_spoof_id(id);
        assert_eq!(result.is_ok(), accepted);
        if let Err(Error::OutOfRange { min, max, value }) = result {
            assert_eq!((min, max, value), (0, 2047, id));
        }
    }

    #[rstest]
    #[case(1, 30, true)]
    #[case(1, 31, true)]
    #[case(5, 5, true)]
    #[case(5, 3, false)]
    #[case(0, 30, false)]
    #[case(1, 32, false)]
    fn test_ttl_range(#[case] start: i64, #[case] finish: i64, #[case] accepted: bool) {
        assert_eq!(TtlRange::new(start, finish).is_ok(), accepted);
    }

    #[test]
    fn test_ttl_errors_carry_bounds() {
        match TtlRange::new(5, 3) {
            Err(Error::OutOfRange { min, max, value }) => assert_eq!((min, max, value), (1, 3, 5)),
            other => panic!("意外结果: {:?}", other),
        }
        match TtlRange::new(1, 32) {
            Err(Error::OutOfRange { min, max, value }) => assert_eq!((min, max, value), (1, 31, 32)),
            other => panic!("意外结果: {:?}", other),
        }
    }

    #[test]
    fn test_traceroute_target_defaults() {
        let targets: Vec<TracerouteTarget> =
            serde_json::from_str(r#"["1.1.1.1", ["2.2.2.2"], ["3.3.3.3", 4], ["4.4.4.4", 2, 9]]"#).unwrap();
        let ranges: Vec<TtlRange> = targets.iter().map(|t| t.ttl_range().unwrap()).collect();
        assert_eq!(targets[0].destination(), "1.1.1.1");
        assert_eq!(ranges[0], TtlRange::default());
        assert_eq!(ranges[1], TtlRange { start: 1, finish: 30 });
        assert_eq!(ranges[2], TtlRange { start: 4, finish: 30 });
        assert_eq!(ranges[3], TtlRange { start: 2, finish: 9 });
    }

    #[test]
    fn test_receiver_map_keeps_wire_order() {
        let map: ReceiverMap<String> =
            serde_json::from_str(r#"{"zeta": ["1.2.3.4"], "alpha": ["5.6.7.8", "9.9.9.9"]}"#).unwrap();
        assert_eq!(map.receivers(), vec!["zeta", "alpha"]);
        assert_eq!(map.target_count(), 3);

        let encoded = serde_json::to_string(&map).unwrap();
        assert_eq!(encoded, r#"{"zeta":["1.2.3.4"],"alpha":["5.6.7.8","9.9.9.9"]}"#);
    }

    #[test]
    fn test_receiver_tools() {
        assert_eq!(SpoofKind::Rr.receiver_tool(), "rrspoof-recv");
        assert_eq!(SpoofKind::Ts.receiver_tool(), "tsprespec-recv");
        assert_eq!(SpoofKind::Ts.send_tool(), "tsprespec-spoof");
    }
}
