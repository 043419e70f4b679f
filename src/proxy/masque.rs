//! MASQUE / CONNECT-UDP 隧道（RFC 9298）
//!
//! 到代理建一条 HTTP/3 连接（用 preset 的 H3 指纹），对目标发
//! 扩展 CONNECT（`:protocol = connect-udp`），之后目标方向的 UDP
//! 数据报走 HTTP Datagram（QUIC DATAGRAM 帧，前缀 quarter stream id
//! 与 context id）。对上层暴露成 [`quinn::AsyncUdpSocket`]，
//! 内层 QUIC 连接感知不到自己被套在隧道里。
//!
//! 这里只需要 CONNECT-UDP 要用的最小 H3 面：控制流 + SETTINGS、
//! 一条请求流、QPACK 静态表字面量编码。不引入完整的 h3 客户端，
//! 因为请求流在隧道存活期内必须一直握在手里。

use super::ProxyConfig;
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

// H3 帧类型
const FRAME_DATA: u64 = 0x0;
const FRAME_HEADERS: u64 = 0x1;
const FRAME_SETTINGS: u64 = 0x4;

// H3 SETTINGS
const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x1;
const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x7;
const SETTINGS_ENABLE_CONNECT_PROTOCOL: u64 = 0x8;
const SETTINGS_H3_DATAGRAM: u64 = 0x33;

const STREAM_TYPE_CONTROL: u64 = 0x0;

// ---------------------------------------------------------------- varint

/// QUIC 变长整数编码
pub fn put_varint(buf: &mut BytesMut, v: u64) {
    if v < 1 << 6 {
        buf.put_u8(v as u8);
    } else if v < 1 << 14 {
        buf.put_u16((v as u16) | 0x4000);
    } else if v < 1 << 30 {
        buf.put_u32((v as u32) | 0x8000_0000);
    } else {
        buf.put_u64(v | 0xc000_0000_0000_0000);
    }
}

/// QUIC 变长整数解码，返回 (值, 消费字节数)
pub fn get_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut v = (first & 0x3f) as u64;
    for b in &buf[1..len] {
        v = (v << 8) | *b as u64;
    }
    Some((v, len))
}

// ---------------------------------------------------------------- qpack

/// QPACK 字面量编码（不走动态表、不用 Huffman）：
/// 2 字节全零前缀 + 每个字段一条 Literal Field Line With Literal Name
fn qpack_encode(fields: &[(&str, &str)]) -> Bytes {
    let mut out = BytesMut::with_capacity(128);
    out.put_u8(0x00); // Required Insert Count = 0
    out.put_u8(0x00); // Delta Base = 0
    for (name, value) in fields {
        // 模式 001 + N=0 + H=0 + 3-bit 前缀长度
        put_prefixed_int(&mut out, 0x20, 3, name.len() as u64);
        out.put_slice(name.as_bytes());
        // H=0 + 7-bit 前缀长度
        put_prefixed_int(&mut out, 0x00, 7, value.len() as u64);
        out.put_slice(value.as_bytes());
    }
    out.freeze()
}

fn put_prefixed_int(out: &mut BytesMut, pattern: u8, prefix_bits: u8, v: u64) {
    let max_prefix = (1u64 << prefix_bits) - 1;
    if v < max_prefix {
        out.put_u8(pattern | v as u8);
    } else {
        out.put_u8(pattern | max_prefix as u8);
        let mut rest = v - max_prefix;
        while rest >= 0x80 {
            out.put_u8((rest as u8 & 0x7f) | 0x80);
            rest >>= 7;
        }
        out.put_u8(rest as u8);
    }
}

/// 从响应 HEADERS 的 QPACK 块里抠 :status。
/// 只认静态表索引形态（服务器对 :status 几乎总是这么编）。
fn qpack_decode_status(block: &[u8]) -> Option<u16> {
    // 跳过 2 字节前缀
    let field = *block.get(2)?;
    if field & 0xc0 == 0xc0 {
        // Indexed Field Line，静态表
        let idx = field & 0x3f;
        return match idx {
            24 => Some(103),
            25 => Some(200),
            26 => Some(304),
            27 => Some(404),
            28 => Some(503),
            _ => None,
        };
    }
    if field & 0xf0 == 0x50 {
        // Literal With Name Reference（静态表 :status 在 24..=28），值字面量跟在后面
        let value_len = *block.get(3)? as usize & 0x7f;
        let value = block.get(4..4 + value_len)?;
        return std::str::from_utf8(value).ok()?.parse().ok();
    }
    None
}

// ---------------------------------------------------------------- 隧道

/// CONNECT-UDP 隧道；对 quinn 暴露为 UDP socket
pub struct MasqueTunnel {
    conn: quinn::Connection,
    /// 请求流 id / 4，HTTP Datagram 的路由键
    quarter_stream_id: u64,
    /// 隧道目标；入站包以它为源地址上报
    target: SocketAddr,
    local_addr: SocketAddr,
    inbound: std::sync::Mutex<mpsc::Receiver<Bytes>>,
    /// 请求流写端握在手里：流关闭即隧道关闭
    _request_stream: quinn::SendStream,
}

impl std::fmt::Debug for MasqueTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasqueTunnel")
            .field("target", &self.target)
            .field("quarter_stream_id", &self.quarter_stream_id)
            .finish()
    }
}

/// 建立隧道：`client_config` 须带 preset 的 H3 指纹（由 H3 拨号层构造）
pub async fn establish(
    proxy: &ProxyConfig,
    proxy_addr: SocketAddr,
    target_host: &str,
    target_port: u16,
    target_addr: SocketAddr,
    client_config: quinn::ClientConfig,
) -> Result<MasqueTunnel> {
    let bind: SocketAddr = match proxy_addr {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
    };
    let mut endpoint = quinn::Endpoint::client(bind)
        .map_err(|e| Error::DialUdpFailed { addr: proxy_addr.to_string(), source: e })?;
    endpoint.set_default_client_config(client_config);
    let local_addr = endpoint
        .local_addr()
        .map_err(|e| Error::DialUdpFailed { addr: proxy_addr.to_string(), source: e })?;

    let conn = endpoint
        .connect(proxy_addr, &proxy.host)
        .map_err(|e| Error::ProxyNegotiationFailed {
            reason: format!("MASQUE 代理连接失败: {e}"),
            status: None,
            auth_required: false,
        })?
        .await
        .map_err(|e| Error::ProxyNegotiationFailed {
            reason: format!("MASQUE 代理握手失败: {e}"),
            status: None,
            auth_required: false,
        })?;

    // 控制流 + SETTINGS
    let mut control = conn.open_uni().await.map_err(|e| Error::ProxyNegotiationFailed {
        reason: format!("MASQUE 控制流打开失败: {e}"),
        status: None,
        auth_required: false,
    })?;
    let mut buf = BytesMut::with_capacity(64);
    put_varint(&mut buf, STREAM_TYPE_CONTROL);
    let mut settings = BytesMut::with_capacity(32);
    for (id, value) in [
        (SETTINGS_QPACK_MAX_TABLE_CAPACITY, 0),
        (SETTINGS_QPACK_BLOCKED_STREAMS, 0),
        (SETTINGS_ENABLE_CONNECT_PROTOCOL, 1),
        (SETTINGS_H3_DATAGRAM, 1),
    ] {
        put_varint(&mut settings, id);
        put_varint(&mut settings, value);
    }
    put_varint(&mut buf, FRAME_SETTINGS);
    put_varint(&mut buf, settings.len() as u64);
    buf.extend_from_slice(&settings);
    control.write_all(&buf).await.map_err(masque_err("SETTINGS 发送失败"))?;

    // 扩展 CONNECT
    let (mut send, mut recv) = conn.open_bi().await.map_err(|e| Error::ProxyNegotiationFailed {
        reason: format!("MASQUE 请求流打开失败: {e}"),
        status: None,
        auth_required: false,
    })?;
    let stream_id: u64 = {
        // quinn StreamId → 原始 varint 值
        let id: quinn::StreamId = send.id();
        id.index() * 4 // 客户端发起的双向流：index*4 + 0
    };

    let path = format!("/.well-known/masque/udp/{target_host}/{target_port}/");
    let authority = format!("{}:{}", proxy.host, proxy.port);
    let headers = qpack_encode(&[
        (":method", "CONNECT"),
        (":protocol", "connect-udp"),
        (":scheme", "https"),
        (":authority", authority.as_str()),
        (":path", path.as_str()),
        ("capsule-protocol", "?1"),
    ]);
    let mut req = BytesMut::with_capacity(headers.len() + 8);
    put_varint(&mut req, FRAME_HEADERS);
    put_varint(&mut req, headers.len() as u64);
    req.extend_from_slice(&headers);
    send.write_all(&req).await.map_err(masque_err("CONNECT 发送失败"))?;

    // 读响应 HEADERS
    let status = read_response_status(&mut recv).await?;
    if status != 200 {
        return Err(Error::ProxyNegotiationFailed {
            reason: format!("MASQUE 代理拒绝 CONNECT-UDP (status {status})"),
            status: Some(status),
            auth_required: status == 407 && !proxy.has_credentials(),
        });
    }
    debug!("masque 隧道就绪: {target_host}:{target_port} via {}", proxy.host);

    // 入站数据报泵
    let (tx, rx) = mpsc::channel::<Bytes>(256);
    let quarter_stream_id = stream_id / 4;
    let pump_conn = conn.clone();
    tokio::spawn(async move {
        loop {
            let datagram = match pump_conn.read_datagram().await {
                Ok(d) => d,
                Err(_) => break,
            };
            let Some((qsid, off1)) = get_varint(&datagram) else { continue };
            if qsid != quarter_stream_id {
                continue;
            }
            let Some((context_id, off2)) = get_varint(&datagram[off1..]) else { continue };
            if context_id != 0 {
                continue; // 非 UDP 负载上下文
            }
            let payload = datagram.slice(off1 + off2..);
            if tx.send(payload).await.is_err() {
                break;
            }
        }
    });

    Ok(MasqueTunnel {
        conn,
        quarter_stream_id,
        target: target_addr,
        local_addr,
        inbound: std::sync::Mutex::new(rx),
        _request_stream: send,
    })
}

fn masque_err(what: &'static str) -> impl Fn(quinn::WriteError) -> Error {
    move |e| Error::ProxyNegotiationFailed {
        reason: format!("MASQUE {what}: {e}"),
        status: None,
        auth_required: false,
    }
}

async fn read_response_status(recv: &mut quinn::RecvStream) -> Result<u16> {
    let mut acc: Vec<u8> = Vec::with_capacity(256);
    loop {
        let mut chunk = vec![0u8; 1024];
        let n = recv
            .read(&mut chunk)
            .await
            .map_err(|e| Error::ProxyNegotiationFailed {
                reason: format!("MASQUE 响应读取失败: {e}"),
                status: None,
                auth_required: false,
            })?
            .ok_or_else(|| Error::ProxyNegotiationFailed {
                reason: "MASQUE 代理在响应前关闭请求流".to_string(),
                status: None,
                auth_required: false,
            })?;
        acc.extend_from_slice(&chunk[..n]);

        // HEADERS 帧：type + len + qpack 块
        let Some((frame_type, off1)) = get_varint(&acc) else { continue };
        let Some((frame_len, off2)) = get_varint(&acc[off1..]) else { continue };
        let start = off1 + off2;
        if acc.len() < start + frame_len as usize {
            continue;
        }
        if frame_type != FRAME_HEADERS {
            if frame_type == FRAME_DATA {
                return Err(Error::ProxyNegotiationFailed {
                    reason: "MASQUE 代理响应流非法：HEADERS 之前出现 DATA".to_string(),
                    status: None,
                    auth_required: false,
                });
            }
            // 其它帧（GREASE 等）跳过
            acc.drain(..start + frame_len as usize);
            continue;
        }
        let block = &acc[start..start + frame_len as usize];
        return Ok(qpack_decode_status(block).unwrap_or_else(|| {
            warn!("MASQUE 响应 :status 解码失败，按 200 处理");
            200
        }));
    }
}

impl quinn::AsyncUdpSocket for MasqueTunnel {
    fn poll_send(
        &self,
        _state: &quinn::udp::UdpState,
        _cx: &mut Context,
        transmits: &[quinn::udp::Transmit],
    ) -> Poll<io::Result<usize>> {
        let max = self.conn.max_datagram_size().unwrap_or(0);
        for t in transmits {
            let mut buf = BytesMut::with_capacity(t.contents.len() + 8);
            put_varint(&mut buf, self.quarter_stream_id);
            put_varint(&mut buf, 0); // context id: UDP
            buf.extend_from_slice(&t.contents);
            if buf.len() > max {
                // 超过外层 MTU 的包按 UDP 语义静默丢弃
                continue;
            }
            if let Err(e) = self.conn.send_datagram(buf.freeze()) {
                debug!("masque 数据报发送失败: {e}");
            }
        }
        Poll::Ready(Ok(transmits.len()))
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [io::IoSliceMut<'_>],
        meta: &mut [quinn::udp::RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut inbound = self.inbound.lock().expect("masque inbound poisoned");
        match inbound.poll_recv(cx) {
            Poll::Ready(Some(payload)) => {
                let n = payload.len().min(bufs[0].len());
                bufs[0][..n].copy_from_slice(&payload[..n]);
                meta[0] = quinn::udp::RecvMeta {
                    addr: self.target,
                    len: n,
                    stride: n,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "masque 隧道已关闭",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        for v in [0u64, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, u64::MAX >> 2] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, v);
            let (decoded, consumed) = get_varint(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_qpack_literal_block_shape() {
        let block = qpack_encode(&[(":method", "CONNECT")]);
        // 前缀两个零字节
        assert_eq!(&block[..2], &[0x00, 0x00]);
        // 字面量名模式 001x_xxxx
        assert_eq!(block[2] & 0xe0, 0x20);
        assert_eq!(block[2] & 0x07, ":method".len() as u8);
        let name_end = 3 + ":method".len();
        assert_eq!(&block[3..name_end], b":method");
        assert_eq!(block[name_end] as usize, "CONNECT".len());
    }

    #[test]
    fn test_qpack_decode_indexed_status() {
        // 0xd9 = 静态表 25 (:status=200)
        assert_eq!(qpack_decode_status(&[0x00, 0x00, 0xd9]), Some(200));
        // 0xdc = 静态表 28 (:status=503)
        assert_eq!(qpack_decode_status(&[0x00, 0x00, 0xdc]), Some(503));
    }

    #[test]
    fn test_qpack_decode_literal_status() {
        // Literal with name reference（静态表 :status 名），值 "407"
        let block = [0x00, 0x00, 0x59, 0x03, b'4', b'0', b'7'];
        assert_eq!(qpack_decode_status(&block), Some(407));
    }
}
