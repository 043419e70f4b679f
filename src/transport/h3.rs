//! HTTP/3 拨号器与连接
//!
//! QUIC endpoint 按 UDP 槽的代理形态选择底座：裸 socket、
//! SOCKS5 UDP 中继、或 MASQUE 隧道——QUIC 本身感知不到差别。
//! 传输参数与 SETTINGS 取自 preset 的 `H3Spec`。
//! 有有效票据时尝试 0-RTT：首个请求标记进 early data，
//! 仅幂等方法参与，除非调用方显式放行。

use super::h1::ResponseHead;
use super::tls::{build_client_config, TlsOptions};
use super::{resolve_for_dial, DialConfig, Origin};
use crate::cancel::CancelToken;
use crate::error::{Error, Protocol, Result};
use crate::proxy::{masque, socks5, ProxyScheme};
use crate::request::Body;
use crate::tickets::TicketRecord;
use bytes::{Buf, Bytes};
use log::debug;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;

/// 票据记录的保守有效期（服务端未给 lifetime 时）
const TICKET_TTL: Duration = Duration::from_secs(2 * 3600);

/// 已就绪的 HTTP/3 连接句柄（克隆即多路复用）
#[derive(Clone)]
pub struct H3Handle {
    send: h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>,
    pub origin: Origin,
    pub created: Instant,
    /// 本次握手是否带 0-RTT
    pub zero_rtt: bool,
}

/// 拨号。`early_data_ok` 由仲裁器按方法幂等性/显式放行计算。
pub async fn dial(
    origin: &Origin,
    config: &DialConfig,
    early_data_ok: bool,
    cancel: &CancelToken,
) -> Result<H3Handle> {
    let ticket = config.tickets.get(
        &origin.host,
        config.preset.name,
        Protocol::Http3,
        config.session_id.as_deref(),
    );
    let try_zero_rtt = early_data_ok && ticket.as_ref().map(|t| t.allows_early_data()).unwrap_or(false);

    // DNS（代理/隧道场景解析目标仍在本地，socks5h 语义只作用于 TCP 面）
    let addrs = resolve_for_dial(origin, config).await?;
    let remote = addrs[0];

    let h3_spec = config.preset.h3.as_ref().ok_or_else(|| Error::Http3Unavailable {
        origin: origin.key(),
        reason: format!("preset {} 不支持 h3", config.preset.name),
    })?;

    // rustls + 传输参数
    let mut tls = build_client_config(
        &config.preset,
        TlsOptions {
            verify_tls: config.verify_tls,
            alpn: vec![b"h3".to_vec()],
            keylog: config.keylog.clone(),
            enable_early_data: true,
        },
    );
    tls.enable_early_data = true;
    let mut client_config = quinn::ClientConfig::new(Arc::new(tls));
    let mut transport = quinn::TransportConfig::default();
    h3_spec.apply_transport(&mut transport);
    client_config.transport_config(Arc::new(transport));

    // endpoint 底座按 UDP 槽选择
    let endpoint = build_endpoint(origin, config, remote, client_config.clone()).await?;

    let connecting = endpoint
        .connect(remote, &origin.host)
        .map_err(|e| Error::Http3Unavailable { origin: origin.key(), reason: e.to_string() })?;

    let (conn, zero_rtt) = if try_zero_rtt {
        match connecting.into_0rtt() {
            Ok((conn, accepted)) => {
                // accepted 解析为 false 时 quinn 自动重放进 1-RTT
                tokio::spawn(async move {
                    let _ = accepted.await;
                });
                (conn, true)
            }
            Err(connecting) => {
                let conn = cancel
                    .guard(async {
                        connecting.await.map_err(|e| Error::Http3Unavailable {
                            origin: origin.key(),
                            reason: e.to_string(),
                        })
                    })
                    .await?;
                (conn, false)
            }
        }
    } else {
        let conn = cancel
            .guard(async {
                connecting.await.map_err(|e| Error::Http3Unavailable {
                    origin: origin.key(),
                    reason: e.to_string(),
                })
            })
            .await?;
        (conn, false)
    };

    // 票据记录：握手闭环即视为可恢复（quinn 内部持有真实票据）
    config.tickets.insert(TicketRecord {
        origin: origin.host.clone(),
        preset: config.preset.name.to_string(),
        protocol: Protocol::Http3,
        ticket: Vec::new(),
        max_early_data: 0xffff_ffff,
        ech_config: None,
        expires_at: SystemTime::now() + TICKET_TTL,
        session_id: config.session_id.clone(),
    });

    let (mut driver, send) = h3::client::new(h3_quinn::Connection::new(conn))
        .await
        .map_err(|e| Error::Http3Unavailable { origin: origin.key(), reason: e.to_string() })?;

    // h3 driver 需要持续 poll_close
    let origin_key = origin.key();
    tokio::spawn(async move {
        if let Err(e) = std::future::poll_fn(|cx| driver.poll_close(cx)).await {
            debug!("h3 connection {origin_key} closed: {e}");
        }
    });

    if zero_rtt {
        debug!("h3 {} dialed with 0-RTT", origin.key());
    }

    Ok(H3Handle { send, origin: origin.clone(), created: Instant::now(), zero_rtt })
}

/// QUIC endpoint：裸 socket / SOCKS5 UDP / MASQUE 三选一
async fn build_endpoint(
    origin: &Origin,
    config: &DialConfig,
    remote: SocketAddr,
    client_config: quinn::ClientConfig,
) -> Result<quinn::Endpoint> {
    let mut endpoint = match &config.udp_proxy {
        None => {
            let bind: SocketAddr = match remote {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            quinn::Endpoint::client(bind)
                .map_err(|e| Error::DialUdpFailed { addr: remote.to_string(), source: e })?
        }
        Some(p) => match p.scheme {
            ProxyScheme::Socks5 { .. } => {
                let socket = socks5::establish_udp(p).await?;
                quinn::Endpoint::new_with_abstract_socket(
                    quinn::EndpointConfig::default(),
                    None,
                    socket,
                    Arc::new(quinn::TokioRuntime),
                )
                .map_err(|e| Error::DialUdpFailed { addr: remote.to_string(), source: e })?
            }
            ProxyScheme::Masque => {
                let proxy_addrs = super::resolve::resolve(&p.host, p.port).await?;
                let proxy_addr = proxy_addrs[0];
                // 隧道外层连接复用同一份 preset 指纹
                let tunnel = masque::establish(
                    p,
                    proxy_addr,
                    &origin.host,
                    origin.port,
                    remote,
                    client_config.clone(),
                )
                .await?;
                quinn::Endpoint::new_with_abstract_socket(
                    quinn::EndpointConfig::default(),
                    None,
                    tunnel,
                    Arc::new(quinn::TokioRuntime),
                )
                .map_err(|e| Error::DialUdpFailed { addr: remote.to_string(), source: e })?
            }
            ProxyScheme::Http => {
                return Err(Error::Configuration(
                    "http 代理无法承载 UDP；UDP 槽请配置 socks5/masque".to_string(),
                ));
            }
        },
    };
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

impl H3Handle {
    /// 发送请求。`early_data` 标记该请求进入 0-RTT 首飞。
    pub async fn send_request(
        &mut self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: &Body,
        cancel: &CancelToken,
    ) -> Result<(ResponseHead, mpsc::Receiver<Result<Bytes>>)> {
        let uri = format!("https://{}{}", self.origin.authority(), path);
        let mut request = http::Request::builder()
            .method(method)
            .uri(&uri)
            .version(http::Version::HTTP_3);
        for (k, v) in headers {
            if k.eq_ignore_ascii_case("host") {
                continue; // h3 从 URI 取 :authority
            }
            request = request.header(k.as_str(), v.as_str());
        }
        let request = request
            .body(())
            .map_err(|e| Error::Configuration(format!("请求构建失败: {e}")))?;

        let mut send = self.send.clone();
        let mut stream = cancel
            .guard(async {
                send.send_request(request).await.map_err(h3_err)
            })
            .await?;

        match body {
            Body::Empty => {}
            Body::Bytes(b) => {
                cancel
                    .guard(async { stream.send_data(b.clone()).await.map_err(h3_err) })
                    .await?;
            }
            Body::Stream(_) => {
                let mut rx = body.take_stream().ok_or_else(|| {
                    Error::Configuration("流式请求体已被消费，无法重放".to_string())
                })?;
                while let Some(chunk) = rx.recv().await {
                    cancel
                        .guard(async { stream.send_data(chunk).await.map_err(h3_err) })
                        .await?;
                }
            }
        }
        cancel.guard(async { stream.finish().await.map_err(h3_err) }).await?;

        let response = cancel
            .guard(async { stream.recv_response().await.map_err(h3_err) })
            .await?;
        let status = response.status().as_u16();
        let mut head_headers = Vec::new();
        for (k, v) in response.headers() {
            if let Ok(value) = v.to_str() {
                head_headers.push((k.as_str().to_string(), value.to_string()));
            }
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes>>(16);
        let drain_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut delivered: u64 = 0;
            loop {
                let next = tokio::select! {
                    _ = drain_cancel.cancelled() => break,
                    r = stream.recv_data() => r,
                };
                match next {
                    Ok(Some(mut chunk)) => {
                        let data = chunk.copy_to_bytes(chunk.remaining());
                        delivered += data.len() as u64;
                        if tx.send(Ok(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::BodyReadFailed {
                                bytes_delivered: delivered,
                                source: std::io::Error::other(e),
                            }))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok((ResponseHead { status, headers: head_headers }, rx))
    }
}

fn h3_err(e: h3::Error) -> Error {
    Error::ProtocolError { protocol: Protocol::Http3, reason: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::lookup;

    #[test]
    fn test_transport_params_applied() {
        let preset = lookup("chrome-143").unwrap();
        let h3 = preset.h3.as_ref().unwrap();
        let mut t = quinn::TransportConfig::default();
        // 不 panic 即配置值全部落在 quinn 的合法域内
        h3.apply_transport(&mut t);
    }

    #[test]
    fn test_ticket_ttl_reasonable() {
        assert!(TICKET_TTL >= Duration::from_secs(3600));
    }
}
