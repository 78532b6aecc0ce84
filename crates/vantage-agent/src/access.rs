//! 访问控制
//!
//! 允许列表的语义为：默认拒绝，放行本机回环地址与控制器主机。控制器主机
//! 发生变化时必须停止监听并以新列表重启。

use std::net::IpAddr;
use tracing::debug;

use vantage_common::{same_host, uri_host, Error, Result};

/// 允许列表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    /// 控制器主机解析出的地址
    allowed: Vec<IpAddr>,
}

impl AllowList {
    /// 只放行回环地址
    pub fn loopback_only() -> Self {
        Self { allowed: Vec::new() }
    }

    /// 放行回环地址与给定地址
    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allowed: addrs.into_iter().map(canonical).collect(),
        }
    }

    /// 由控制器 URI 构造，主机名在构造时解析
    pub async fn build(controller_uri: &str) -> Result<Self> {
        let host = uri_host(controller_uri)?;
        let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| Error::Network(format!("无法解析控制器主机 {}: {}", host, e)))?
                .map(|addr| addr.ip())
                .collect(),
        };
        debug!("允许列表: 回环地址与 {} {:?}", host, addrs);
        Ok(Self::from_addrs(addrs))
    }

    /// 是否放行来自 `peer` 的连接
    pub fn permits(&self, peer: IpAddr) -> bool {
        let peer = canonical(peer);
        peer.is_loopback() || self.allowed.contains(&peer)
    }

    /// 放行的非回环地址
    pub fn allowed(&self) -> &[IpAddr] {
        &self.allowed
    }
}

/// 把 IPv4 映射的 IPv6 地址还原为 IPv4
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// 切换控制器时是否需要重启监听器：启用访问控制且主机不同
pub fn needs_restart(acl: bool, old_uri: &str, new_uri: &str) -> bool {
    acl && !same_host(old_uri, new_uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn test_build_from_ip_uri() {
        let list = AllowList::build("http://10.1.2.3:5000").await.unwrap();
        assert!(list.permits("10.1.2.3".parse().unwrap()));
        assert!(list.permits(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(list.permits(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!list.permits("10.1.2.4".parse().unwrap()));
    }

    #[test]
    fn test_mapped_addresses() {
        let list = AllowList::from_addrs(["192.0.2.7".parse().unwrap()]);
        let mapped: IpAddr = "::ffff:192.0.2.7".parse().unwrap();
        assert!(list.permits(mapped));
        assert!(!AllowList::loopback_only().permits(mapped));
    }

    #[tokio::test]
    async fn test_build_rejects_bad_uri() {
        assert!(matches!(
            AllowList::build("not a uri").await,
            Err(Error::BadControllerUri(_))
        ));
    }

    #[rstest]
    #[case(true, "http://ctl:5000", "http://ctl:6000", false)]
    #[case(true, "http://ctl:5000", "http://other:5000", true)]
    #[case(false, "http://ctl:5000", "http://other:5000", false)]
    fn test_needs_restart(#[case] acl: bool, #[case] old: &str, #[case] new: &str, #[case] expected: bool) {
        assert_eq!(needs_restart(acl, old, new), expected);
    }
}
