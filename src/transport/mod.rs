//! 传输层
//!
//! 三个拨号器（H1/H2/H3）共享同一份契约：
//! `dial(origin, 代理, preset, 票据, 截止, 取消) → 连接`。
//! 共同前奏在 `dial_prelude`：解析地址、Happy Eyeballs 交错、
//! 每地址预算分摊、本地绑定过滤。证书 pin 在握手后校验，
//! 不匹配是致命错误。重试永远发生在仲裁器/引擎，不在拨号器里。

pub mod arbiter;
pub mod h1;
pub mod h2;
pub mod h3;
pub mod pool;
pub mod resolve;
pub mod tls;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::keylog::KeyLogSink;
use crate::preset::Preset;
use crate::proxy::ProxyConfig;
use crate::tickets::TicketCache;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// 拨号目标（scheme + host + port）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub https: bool,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(https: bool, host: impl Into<String>, port: u16) -> Self {
        Self { https, host: host.into().to_ascii_lowercase(), port }
    }

    /// Host 头 / :authority 的形态（默认端口省略）
    pub fn authority(&self) -> String {
        let default = if self.https { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// 池键与仲裁键里的标识
    pub fn key(&self) -> String {
        format!("{}://{}:{}", if self.https { "https" } else { "http" }, self.host, self.port)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// 拨号器共享的配置快照
#[derive(Clone)]
pub struct DialConfig {
    pub preset: Arc<Preset>,
    pub tcp_proxy: Option<ProxyConfig>,
    pub udp_proxy: Option<ProxyConfig>,
    pub verify_tls: bool,
    pub keylog: Option<Arc<KeyLogSink>>,
    pub tickets: TicketCache,
    pub cert_pins: Vec<tls::CertPin>,
    pub local_bind: Option<IpAddr>,
    pub connect_timeout: Duration,
    /// GREASE 抽取种子（会话派生）
    pub session_seed: u64,
    pub session_id: Option<String>,
    /// 仲裁器对该 (代理, 协议) 关闭了预写式 CONNECT
    pub speculative_disabled: bool,
}

/// 读写流装箱（明文 / TLS / 预写式 CONNECT+TLS 共用一个形态）
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}
pub type BoxStream = Box<dyn AsyncStream>;

/// 带每地址预算的 TCP 连接：`min(剩余预算/剩余地址, 10s)`
pub async fn connect_tcp_budgeted(
    addrs: &[SocketAddr],
    overall: Duration,
    cancel: &CancelToken,
) -> Result<TcpStream> {
    let started = Instant::now();
    let mut last_err: Option<Error> = None;

    for (i, addr) in addrs.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let remaining_budget = overall.saturating_sub(started.elapsed());
        if remaining_budget.is_zero() {
            break;
        }
        let budget = resolve::per_addr_budget(remaining_budget, addrs.len() - i);

        let attempt = async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| Error::DialTcpFailed { addr: addr.to_string(), source: e })
        };
        match cancel
            .child_with_deadline(Instant::now() + budget)
            .guard(attempt)
            .await
        {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e @ Error::Cancelled) => return Err(e),
            Err(e) => {
                log::debug!("dial {addr} failed within {budget:?}: {e}");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or(Error::DeadlineExceeded(overall)))
}

/// 解析 + 交错 + 族过滤，一步到位
pub async fn resolve_for_dial(origin: &Origin, config: &DialConfig) -> Result<Vec<SocketAddr>> {
    let addrs = resolve::resolve(&origin.host, origin.port).await?;
    let addrs = resolve::filter_family(addrs, config.local_bind);
    if addrs.is_empty() {
        return Err(Error::DnsFailed { host: origin.host.clone(), source: None });
    }
    Ok(resolve::interleave(addrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_authority_elides_default_port() {
        assert_eq!(Origin::new(true, "Example.Test", 443).authority(), "example.test");
        assert_eq!(Origin::new(true, "example.test", 8443).authority(), "example.test:8443");
        assert_eq!(Origin::new(false, "example.test", 80).authority(), "example.test");
    }

    #[tokio::test]
    async fn test_budgeted_connect_tries_next_addr() {
        // 第一个地址是黑洞（保留网段），第二个是本机真实监听
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = listener.local_addr().unwrap();
        let addrs = vec!["192.0.2.1:81".parse().unwrap(), good];

        let cancel = CancelToken::new();
        let stream =
            connect_tcp_budgeted(&addrs, Duration::from_secs(2), &cancel).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), good);
    }

    #[tokio::test]
    async fn test_budgeted_connect_cancel() {
        let addrs = vec!["192.0.2.1:81".parse().unwrap()];
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = connect_tcp_budgeted(&addrs, Duration::from_secs(5), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
