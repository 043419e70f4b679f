//! SOCKS5 代理（RFC 1928 / RFC 1929）
//!
//! TCP 面：问候、方法协商（NoAuth 或用户名密码）、CONNECT、回执。
//! UDP 面：UDP ASSOCIATE 在 TCP 控制连接上协商出中继端点，
//! 之后每个出站数据报都带 `RSV(2) FRAG(1) ATYP(1) DSTADDR DSTPORT`
//! 头；入站反向剥头。FRAG != 0 直接拒绝。控制连接关闭即中继拆除，
//! 所以控制流与 UDP socket 同生命周期。QUIC 原样跑在上面。

use super::ProxyConfig;
use crate::error::{Error, Result};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// 回执码 → 可读原因
fn reply_reason(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

fn negotiation_failed(reason: impl Into<String>) -> Error {
    Error::ProxyNegotiationFailed { reason: reason.into(), status: None, auth_required: false }
}

/// 问候 + 方法协商 + 可选的用户名密码子协商
async fn handshake(stream: &mut TcpStream, proxy: &ProxyConfig) -> Result<()> {
    let greeting: &[u8] = if proxy.has_credentials() {
        &[VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[VERSION, 0x01, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await.map_err(|e| negotiation_failed(format!("SOCKS5 问候失败: {e}")))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| negotiation_failed(format!("SOCKS5 方法协商读取失败: {e}")))?;
    if choice[0] != VERSION {
        return Err(negotiation_failed(format!("非法 SOCKS 版本: {}", choice[0])));
    }

    match choice[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_USER_PASS => {
            let (user, pass) = match (&proxy.username, &proxy.password) {
                (Some(u), p) => (u.as_str(), p.as_deref().unwrap_or("")),
                _ => {
                    return Err(Error::ProxyNegotiationFailed {
                        reason: "代理要求认证但未提供凭据".to_string(),
                        status: None,
                        auth_required: true,
                    });
                }
            };
            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01);
            req.push(user.len() as u8);
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            stream
                .write_all(&req)
                .await
                .map_err(|e| negotiation_failed(format!("SOCKS5 认证发送失败: {e}")))?;

            let mut resp = [0u8; 2];
            stream
                .read_exact(&mut resp)
                .await
                .map_err(|e| negotiation_failed(format!("SOCKS5 认证响应读取失败: {e}")))?;
            if resp[1] != 0x00 {
                return Err(Error::ProxyNegotiationFailed {
                    reason: "SOCKS5 用户名密码认证被拒".to_string(),
                    status: None,
                    auth_required: true,
                });
            }
            Ok(())
        }
        METHOD_UNACCEPTABLE => Err(negotiation_failed("代理不接受提供的认证方法")),
        other => Err(negotiation_failed(format!("代理选择了未知认证方法: {other}"))),
    }
}

/// 写请求的地址部分
fn push_target(req: &mut Vec<u8>, host: &str, port: u16, remote_dns: bool) {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) if remote_dns => {
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
        Err(_) => {
            // socks5:// 本应在上层先解析；域名兜底仍按名传递
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
}

/// 读回执，返回 BND.ADDR:BND.PORT
async fn read_reply(stream: &mut TcpStream) -> Result<SocketAddr> {
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| negotiation_failed(format!("SOCKS5 回执读取失败: {e}")))?;
    if head[1] != 0x00 {
        return Err(negotiation_failed(format!(
            "SOCKS5 请求被拒 (0x{:02x}): {}",
            head[1],
            reply_reason(head[1])
        )));
    }
    let addr = match head[3] {
        ATYP_IPV4 => {
            let mut b = [0u8; 6];
            stream.read_exact(&mut b).await.map_err(|e| negotiation_failed(e.to_string()))?;
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])),
                u16::from_be_bytes([b[4], b[5]]),
            )
        }
        ATYP_IPV6 => {
            let mut b = [0u8; 18];
            stream.read_exact(&mut b).await.map_err(|e| negotiation_failed(e.to_string()))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b[..16]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), u16::from_be_bytes([b[16], b[17]]))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(|e| negotiation_failed(e.to_string()))?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await.map_err(|e| negotiation_failed(e.to_string()))?;
            // 中继端点按名返回的实现极少；退回代理主机本身
            let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        }
        other => return Err(negotiation_failed(format!("未知地址类型: {other}"))),
    };
    Ok(addr)
}

/// CONNECT：返回已就绪的隧道流
pub async fn establish_tcp(
    mut stream: TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
    remote_dns: bool,
) -> Result<TcpStream> {
    handshake(&mut stream, proxy).await?;

    let mut req = vec![VERSION, CMD_CONNECT, 0x00];
    push_target(&mut req, host, port, remote_dns);
    stream
        .write_all(&req)
        .await
        .map_err(|e| negotiation_failed(format!("SOCKS5 CONNECT 发送失败: {e}")))?;

    read_reply(&mut stream).await?;
    Ok(stream)
}

// ---------------------------------------------------------------- UDP

/// 编码 SOCKS5 UDP 头：`RSV(2) FRAG(1) ATYP(1) DSTADDR DSTPORT`
pub fn encode_udp_header(target: SocketAddr) -> Vec<u8> {
    let mut h = Vec::with_capacity(22);
    h.extend_from_slice(&[0x00, 0x00, 0x00]);
    match target.ip() {
        IpAddr::V4(ip) => {
            h.push(ATYP_IPV4);
            h.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            h.push(ATYP_IPV6);
            h.extend_from_slice(&ip.octets());
        }
    }
    h.extend_from_slice(&target.port().to_be_bytes());
    h
}

/// 解析 SOCKS5 UDP 头，返回 (负载偏移, 源地址)
pub fn parse_udp_header(packet: &[u8]) -> Result<(usize, SocketAddr)> {
    if packet.len() < 10 {
        return Err(negotiation_failed("SOCKS5 UDP 包过短"));
    }
    if packet[2] != 0x00 {
        return Err(negotiation_failed(format!("不支持 SOCKS5 UDP 分片 (FRAG={})", packet[2])));
    }
    match packet[3] {
        ATYP_IPV4 => {
            let addr = SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(packet[4], packet[5], packet[6], packet[7])),
                u16::from_be_bytes([packet[8], packet[9]]),
            );
            Ok((10, addr))
        }
        ATYP_IPV6 => {
            if packet.len() < 22 {
                return Err(negotiation_failed("SOCKS5 UDP IPv6 包过短"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[4..20]);
            let addr = SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                u16::from_be_bytes([packet[20], packet[21]]),
            );
            Ok((22, addr))
        }
        other => Err(negotiation_failed(format!("SOCKS5 UDP 未知地址类型: {other}"))),
    }
}

/// UDP ASSOCIATE 出来的数据报通道
///
/// 对 quinn 暴露成 [`quinn::AsyncUdpSocket`]；持有控制 TCP 连接，
/// drop 即拆除中继。
#[derive(Debug)]
pub struct Socks5UdpSocket {
    io: UdpSocket,
    relay: SocketAddr,
    /// 存活期决定中继存活期
    _control: TcpStream,
}

/// 协商 UDP ASSOCIATE 并绑定本地 UDP socket
pub async fn establish_udp(proxy: &ProxyConfig) -> Result<Socks5UdpSocket> {
    let mut control = TcpStream::connect(proxy.addr())
        .await
        .map_err(|e| Error::DialTcpFailed { addr: proxy.addr(), source: e })?;
    handshake(&mut control, proxy).await?;

    // DST.ADDR/DST.PORT 全零：中继对所有目标开放
    let mut req = vec![VERSION, CMD_UDP_ASSOCIATE, 0x00];
    push_target(&mut req, "0.0.0.0", 0, false);
    control
        .write_all(&req)
        .await
        .map_err(|e| negotiation_failed(format!("UDP ASSOCIATE 发送失败: {e}")))?;

    let mut relay = read_reply(&mut control).await?;
    // 回执带 0.0.0.0 时用代理主机地址补全
    if relay.ip().is_unspecified() {
        let proxy_ip = control
            .peer_addr()
            .map_err(|e| negotiation_failed(format!("取代理地址失败: {e}")))?;
        relay.set_ip(proxy_ip.ip());
    }

    let bind_addr: SocketAddr = match relay {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let io = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::DialUdpFailed { addr: relay.to_string(), source: e })?;

    Ok(Socks5UdpSocket { io, relay, _control: control })
}

impl quinn::AsyncUdpSocket for Socks5UdpSocket {
    fn poll_send(
        &self,
        _state: &quinn::udp::UdpState,
        cx: &mut Context,
        transmits: &[quinn::udp::Transmit],
    ) -> Poll<io::Result<usize>> {
        let mut sent = 0;
        for t in transmits {
            let mut packet = encode_udp_header(t.destination);
            packet.extend_from_slice(&t.contents);
            match self.io.poll_send_to(cx, &packet, self.relay) {
                Poll::Ready(Ok(_)) => sent += 1,
                Poll::Ready(Err(e)) => {
                    if sent > 0 {
                        return Poll::Ready(Ok(sent));
                    }
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => {
                    if sent > 0 {
                        return Poll::Ready(Ok(sent));
                    }
                    return Poll::Pending;
                }
            }
        }
        Poll::Ready(Ok(sent))
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [io::IoSliceMut<'_>],
        meta: &mut [quinn::udp::RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut scratch = [0u8; 65535];
        let mut read_buf = ReadBuf::new(&mut scratch);
        let _from = match self.io.poll_recv_from(cx, &mut read_buf) {
            Poll::Ready(Ok(a)) => a,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        let packet = read_buf.filled();
        let (offset, src) = match parse_udp_header(packet) {
            Ok(v) => v,
            // 坏包丢弃；让 quinn 继续等下一个
            Err(_) => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        };
        let payload = &packet[offset..];
        let n = payload.len().min(bufs[0].len());
        bufs[0][..n].copy_from_slice(&payload[..n]);
        meta[0] = quinn::udp::RecvMeta {
            addr: src,
            len: n,
            stride: n,
            ecn: None,
            dst_ip: None,
        };
        Poll::Ready(Ok(1))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_header_fixture() {
        let addr: SocketAddr = "1.2.3.4:443".parse().unwrap();
        let header = encode_udp_header(addr);
        assert_eq!(header, [0x00, 0x00, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x01, 0xbb]);

        let mut packet = header.clone();
        packet.extend_from_slice(b"payload");
        let (offset, parsed) = parse_udp_header(&packet).unwrap();
        assert_eq!(offset, 10);
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_udp_header_roundtrip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:8443".parse().unwrap();
        let header = encode_udp_header(addr);
        let (offset, parsed) = parse_udp_header(&header).unwrap();
        assert_eq!(offset, 22);
        assert_eq!(parsed, addr);
        // 往返后字节一致
        assert_eq!(encode_udp_header(parsed), header);
    }

    #[test]
    fn test_udp_frag_refused() {
        let mut packet = encode_udp_header("1.2.3.4:443".parse().unwrap());
        packet[2] = 0x01;
        assert!(parse_udp_header(&packet).is_err());
    }

    #[test]
    fn test_reply_reason_mapping() {
        assert_eq!(reply_reason(0x05), "connection refused");
        assert_eq!(reply_reason(0x07), "command not supported");
    }

    #[tokio::test]
    async fn test_establish_tcp_no_auth() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            conn.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            conn.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..3], &[0x05, 0x01, 0x00]);
            assert_eq!(head[3], ATYP_DOMAIN);
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            conn.read_exact(&mut rest).await.unwrap();

            conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let proxy = ProxyConfig::parse(&format!("socks5h://{addr}")).unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let result = establish_tcp(stream, &proxy, "example.test", 443, true).await;
        assert!(result.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_establish_tcp_rejected_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            conn.write_all(&[0x05, 0x00]).await.unwrap();
            let mut rest = [0u8; 64];
            let _ = conn.read(&mut rest).await.unwrap();
            conn.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let proxy = ProxyConfig::parse(&format!("socks5://{addr}")).unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let err = establish_tcp(stream, &proxy, "1.2.3.4", 443, false).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"), "{err}");
    }
}
