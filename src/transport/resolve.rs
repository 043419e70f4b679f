//! 地址解析与拨号预算
//!
//! hickory 解析 A/AAAA；Happy Eyeballs 把 v4/v6 交错排列。
//! 每地址预算 `min(剩余预算 / 剩余地址数, 10s)`：第一个慢地址
//! 拖不垮后面的候选。配置了本地绑定地址时只保留同族地址。

use crate::error::{Error, Result};
use hickory_resolver::TokioAsyncResolver;
use log::debug;
use once_cell::sync::OnceCell;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// 每地址预算上限
const PER_ADDR_CAP: Duration = Duration::from_secs(10);

static RESOLVER: OnceCell<TokioAsyncResolver> = OnceCell::new();

fn resolver() -> &'static TokioAsyncResolver {
    RESOLVER.get_or_init(|| {
        TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(
                hickory_resolver::config::ResolverConfig::default(),
                hickory_resolver::config::ResolverOpts::default(),
            )
        })
    })
}

/// 解析 host 为地址列表（字面量 IP 直接返回）
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let response = resolver().lookup_ip(host).await.map_err(|e| Error::DnsFailed {
        host: host.to_string(),
        source: Some(std::io::Error::other(e)),
    })?;

    let addrs: Vec<SocketAddr> = response.iter().map(|ip| SocketAddr::new(ip, port)).collect();
    if addrs.is_empty() {
        return Err(Error::DnsFailed { host: host.to_string(), source: None });
    }
    debug!("resolved {host} -> {} addrs", addrs.len());
    Ok(addrs)
}

/// Happy Eyeballs 交错：v4 与 v6 轮流，IPv6 打头
pub fn interleave(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let (v6, v4): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.is_ipv6());
    let mut out = Vec::with_capacity(v4.len() + v6.len());
    let mut v6 = v6.into_iter();
    let mut v4 = v4.into_iter();
    loop {
        match (v6.next(), v4.next()) {
            (None, None) => break,
            (a, b) => {
                out.extend(a);
                out.extend(b);
            }
        }
    }
    out
}

/// 本地绑定地址限定地址族
pub fn filter_family(addrs: Vec<SocketAddr>, local_bind: Option<IpAddr>) -> Vec<SocketAddr> {
    match local_bind {
        Some(IpAddr::V4(_)) => addrs.into_iter().filter(|a| a.is_ipv4()).collect(),
        Some(IpAddr::V6(_)) => addrs.into_iter().filter(|a| a.is_ipv6()).collect(),
        None => addrs,
    }
}

/// 剩余预算均分给剩余地址，上限 10s
pub fn per_addr_budget(remaining_budget: Duration, remaining_addrs: usize) -> Duration {
    if remaining_addrs == 0 {
        return Duration::ZERO;
    }
    (remaining_budget / remaining_addrs as u32).min(PER_ADDR_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_interleave_alternates_families() {
        let addrs = vec![
            addr("10.0.0.1:443"),
            addr("10.0.0.2:443"),
            addr("[2001:db8::1]:443"),
            addr("[2001:db8::2]:443"),
        ];
        let ordered = interleave(addrs);
        assert!(ordered[0].is_ipv6());
        assert!(ordered[1].is_ipv4());
        assert!(ordered[2].is_ipv6());
        assert!(ordered[3].is_ipv4());
    }

    #[test]
    fn test_interleave_uneven() {
        let addrs = vec![addr("10.0.0.1:443"), addr("10.0.0.2:443"), addr("10.0.0.3:443")];
        let ordered = interleave(addrs);
        assert_eq!(ordered.len(), 3);
    }

    #[test]
    fn test_per_addr_budget_divides() {
        // 总预算 6s、3 个地址 → 每地址 2s
        assert_eq!(per_addr_budget(Duration::from_secs(6), 3), Duration::from_secs(2));
    }

    #[test]
    fn test_per_addr_budget_capped() {
        assert_eq!(per_addr_budget(Duration::from_secs(120), 2), PER_ADDR_CAP);
    }

    #[test]
    fn test_filter_family() {
        let addrs = vec![addr("10.0.0.1:443"), addr("[2001:db8::1]:443")];
        let v4only = filter_family(addrs.clone(), Some("0.0.0.0".parse().unwrap()));
        assert_eq!(v4only.len(), 1);
        assert!(v4only[0].is_ipv4());
        let all = filter_family(addrs, None);
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let addrs = resolve("127.0.0.1", 443).await.unwrap();
        assert_eq!(addrs, vec![addr("127.0.0.1:443")]);
    }
}
