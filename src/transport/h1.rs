//! HTTP/1.1 拨号器与连接
//!
//! TCP（可经代理）→ TLS（preset 指纹）→ 成帧的 1.1 连接。
//! 请求头按模板顺序逐字写出。响应体全量排干后连接才许回池，
//! 中途放弃的连接直接关闭。经 HTTP 代理时默认预写式 CONNECT
//! （CONNECT 与 ClientHello 同一次 TCP 发送），被仲裁器拉黑后
//! 退回顺序式。

use super::tls::{alert_code, build_client_config, verify_pins, TlsOptions};
use super::{connect_tcp_budgeted, resolve_for_dial, BoxStream, DialConfig, Origin};
use crate::cancel::CancelToken;
use crate::error::{Error, Protocol, Result};
use crate::proxy::connect::speculative_status;
use crate::proxy::{self, ProxyScheme, SpeculativeConnectStream};
use crate::request::Body;
use bytes::Bytes;
use log::debug;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;

/// 响应头累计上限
const MAX_HEAD: usize = 64 * 1024;
/// 体分块大小
const CHUNK: usize = 16 * 1024;

/// 已就绪的 HTTP/1.1 连接
pub struct H1Conn {
    stream: BoxStream,
    pub origin: Origin,
    pub created: Instant,
    /// 上一响应遗留的未消费字节
    residual: Vec<u8>,
}

/// 响应头部分
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// 拨号：返回指纹正确、可立即发请求的连接
pub async fn dial(origin: &Origin, config: &DialConfig, cancel: &CancelToken) -> Result<H1Conn> {
    let stream = dial_stream(origin, config, cancel, Protocol::Http1).await?;
    Ok(H1Conn { stream, origin: origin.clone(), created: Instant::now(), residual: Vec::new() })
}

/// H1/H2 共用的流建立：TCP（直连或代理）+ 可选 TLS
pub(super) async fn dial_stream(
    origin: &Origin,
    config: &DialConfig,
    cancel: &CancelToken,
    proto: Protocol,
) -> Result<BoxStream> {
    let speculative = matches!(
        config.tcp_proxy.as_ref().map(|p| p.scheme),
        Some(ProxyScheme::Http)
    ) && origin.https
        && !config.speculative_disabled;
    if speculative {
        debug!("speculative CONNECT enabled for {origin}");
    }

    // TCP 段
    let tcp = match &config.tcp_proxy {
        Some(p) if !speculative => {
            let attempt = proxy::dial_tcp(p, &origin.host, origin.port, config.connect_timeout);
            cancel.guard(attempt).await?
        }
        Some(p) => {
            // 预写式：只连到代理，CONNECT 由流包装器合并进首次写出
            let addrs = super::resolve::resolve(&p.host, p.port).await?;
            let addrs = super::resolve::interleave(addrs);
            connect_tcp_budgeted(&addrs, config.connect_timeout, cancel).await?
        }
        None => {
            let addrs = resolve_for_dial(origin, config).await?;
            connect_tcp_budgeted(&addrs, config.connect_timeout, cancel).await?
        }
    };

    if !origin.https {
        return Ok(Box::new(tcp));
    }

    // TLS 段
    let alpn = config.preset.tls.alpn_for(proto);
    let tls_config = build_client_config(
        &config.preset,
        TlsOptions {
            verify_tls: config.verify_tls,
            alpn,
            keylog: config.keylog.clone(),
            enable_early_data: false,
        },
    );
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::ServerName::try_from(origin.host.as_str())
        .map_err(|_| Error::Configuration(format!("非法 SNI: {}", origin.host)))?;

    if speculative {
        let p = config.tcp_proxy.as_ref().expect("speculative implies proxy");
        let wrapped = SpeculativeConnectStream::new(tcp, p, &origin.host, origin.port);
        let handshake = async {
            connector.connect(server_name, wrapped).await.map_err(map_tls_error)
        };
        let stream = cancel.guard(handshake).await?;
        check_pins(config, stream.get_ref().1, &origin.host)?;
        Ok(Box::new(stream))
    } else {
        let handshake = async {
            connector.connect(server_name, tcp).await.map_err(map_tls_error)
        };
        let stream = cancel.guard(handshake).await?;
        check_pins(config, stream.get_ref().1, &origin.host)?;
        Ok(Box::new(stream))
    }
}

fn check_pins(config: &DialConfig, conn: &rustls::ClientConnection, host: &str) -> Result<()> {
    if config.cert_pins.is_empty() {
        return Ok(());
    }
    let certs = conn.peer_certificates().unwrap_or(&[]);
    verify_pins(&config.cert_pins, certs, host)
}

/// TLS 握手 IO 错误归类：预写式状态码 → SpeculativeTls，
/// rustls 告警 → TlsHandshakeFailed(alert)
fn map_tls_error(e: std::io::Error) -> Error {
    if let Some(status) = speculative_status(&e) {
        return Error::SpeculativeTls { op: "status", status: Some(status), source: Some(e) };
    }
    let alert = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .and_then(alert_code);
    Error::TlsHandshakeFailed { op: "client_hello", alert, source: Some(Box::new(e)) }
}

impl H1Conn {
    /// 发送一个请求。返回响应头、体分块流，以及连接归还通道：
    /// 体排干且允许复用时，连接从 `reuse` 送回；否则通道直接关闭。
    pub async fn send_request(
        mut self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: &Body,
        cancel: &CancelToken,
    ) -> Result<(ResponseHead, mpsc::Receiver<Result<Bytes>>, oneshot::Receiver<H1Conn>)> {
        // 请求头按模板顺序逐字写出
        let mut head = format!("{method} {path} HTTP/1.1\r\n");
        for (k, v) in headers {
            head.push_str(k);
            head.push_str(": ");
            head.push_str(v);
            head.push_str("\r\n");
        }
        let body_bytes = match body {
            Body::Empty => None,
            Body::Bytes(b) => {
                head.push_str(&format!("Content-Length: {}\r\n", b.len()));
                Some(b.clone())
            }
            Body::Stream(_) => {
                head.push_str("Transfer-Encoding: chunked\r\n");
                None
            }
        };
        head.push_str("\r\n");

        let write_all = async {
            self.stream
                .write_all(head.as_bytes())
                .await
                .map_err(|e| Error::BodyWriteFailed { source: e })?;
            if let Some(b) = &body_bytes {
                self.stream
                    .write_all(b)
                    .await
                    .map_err(|e| Error::BodyWriteFailed { source: e })?;
            } else if let Some(mut rx) = body.take_stream() {
                while let Some(chunk) = rx.recv().await {
                    let frame = format!("{:x}\r\n", chunk.len());
                    self.stream
                        .write_all(frame.as_bytes())
                        .await
                        .map_err(|e| Error::BodyWriteFailed { source: e })?;
                    self.stream
                        .write_all(&chunk)
                        .await
                        .map_err(|e| Error::BodyWriteFailed { source: e })?;
                    self.stream
                        .write_all(b"\r\n")
                        .await
                        .map_err(|e| Error::BodyWriteFailed { source: e })?;
                }
                self.stream
                    .write_all(b"0\r\n\r\n")
                    .await
                    .map_err(|e| Error::BodyWriteFailed { source: e })?;
            }
            self.stream.flush().await.map_err(|e| Error::BodyWriteFailed { source: e })?;
            Ok(())
        };
        cancel.guard(write_all).await?;

        // 响应头
        let head = cancel.guard(self.read_head()).await?;
        let (head, framing) = head;

        // 排干任务：体读完且连接可复用时经 reuse 通道归还
        let (body_tx, body_rx) = mpsc::channel::<Result<Bytes>>(16);
        let (reuse_tx, reuse_rx) = oneshot::channel::<H1Conn>();
        let keep_alive = !head
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"));
        let head_only = method == "HEAD" || matches!(head.status, 204 | 304);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut conn = self;
            let framing = if head_only { BodyFraming::None } else { framing };
            let clean = conn.drain_body(framing, &body_tx, &cancel).await;
            if clean && keep_alive {
                let _ = reuse_tx.send(conn);
            }
        });

        Ok((head, body_rx, reuse_rx))
    }

    async fn read_head(&mut self) -> Result<(ResponseHead, BodyFraming)> {
        let mut acc = std::mem::take(&mut self.residual);
        loop {
            if let Some((head, consumed)) = parse_head(&acc)? {
                let framing = BodyFraming::from_headers(&head.headers);
                self.residual = acc[consumed..].to_vec();
                return Ok((head, framing));
            }
            if acc.len() > MAX_HEAD {
                return Err(Error::ProtocolError {
                    protocol: Protocol::Http1,
                    reason: "响应头超过 64 KiB".to_string(),
                });
            }
            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::BodyReadFailed { bytes_delivered: 0, source: e })?;
            if n == 0 {
                return Err(Error::ProtocolError {
                    protocol: Protocol::Http1,
                    reason: "对端在响应头前关闭连接".to_string(),
                });
            }
            acc.extend_from_slice(&chunk[..n]);
        }
    }

    /// 返回 true 表示体干净读完（连接可复用）
    async fn drain_body(
        &mut self,
        framing: BodyFraming,
        tx: &mpsc::Sender<Result<Bytes>>,
        cancel: &CancelToken,
    ) -> bool {
        match framing {
            BodyFraming::None => true,
            BodyFraming::ContentLength(total) => {
                let mut remaining = total;
                // 先吐 residual
                while remaining > 0 {
                    if !self.residual.is_empty() {
                        let take = self.residual.len().min(remaining as usize);
                        let chunk: Vec<u8> = self.residual.drain(..take).collect();
                        remaining -= take as u64;
                        if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                            return false;
                        }
                        continue;
                    }
                    let mut buf = vec![0u8; CHUNK.min(remaining as usize)];
                    let read = tokio::select! {
                        _ = cancel.cancelled() => return false,
                        r = self.stream.read(&mut buf) => r,
                    };
                    match read {
                        Ok(0) => {
                            let _ = tx
                                .send(Err(Error::BodyReadFailed {
                                    bytes_delivered: total - remaining,
                                    source: std::io::ErrorKind::UnexpectedEof.into(),
                                }))
                                .await;
                            return false;
                        }
                        Ok(n) => {
                            buf.truncate(n);
                            remaining -= n as u64;
                            if tx.send(Ok(Bytes::from(buf))).await.is_err() {
                                return false;
                            }
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Err(Error::BodyReadFailed {
                                    bytes_delivered: total - remaining,
                                    source: e,
                                }))
                                .await;
                            return false;
                        }
                    }
                }
                true
            }
            BodyFraming::Chunked => self.drain_chunked(tx, cancel).await,
            BodyFraming::UntilClose => {
                if !self.residual.is_empty() {
                    let chunk = std::mem::take(&mut self.residual);
                    if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                        return false;
                    }
                }
                loop {
                    let mut buf = vec![0u8; CHUNK];
                    let read = tokio::select! {
                        _ = cancel.cancelled() => return false,
                        r = self.stream.read(&mut buf) => r,
                    };
                    match read {
                        // 读到 EOF 即体结束；该连接本来就不可复用
                        Ok(0) => return false,
                        Ok(n) => {
                            buf.truncate(n);
                            if tx.send(Ok(Bytes::from(buf))).await.is_err() {
                                return false;
                            }
                        }
                        Err(_) => return false,
                    }
                }
            }
        }
    }

    async fn drain_chunked(
        &mut self,
        tx: &mpsc::Sender<Result<Bytes>>,
        cancel: &CancelToken,
    ) -> bool {
        loop {
            // 凑一行 chunk 大小
            let size_line = loop {
                if let Some(pos) = find_crlf(&self.residual) {
                    let line: Vec<u8> = self.residual.drain(..pos + 2).collect();
                    break String::from_utf8_lossy(&line[..pos]).to_string();
                }
                if !self.fill_residual(cancel).await {
                    return false;
                }
            };
            let size = match usize::from_str_radix(size_line.trim().split(';').next().unwrap_or(""), 16)
            {
                Ok(s) => s,
                Err(_) => {
                    let _ = tx
                        .send(Err(Error::ProtocolError {
                            protocol: Protocol::Http1,
                            reason: format!("非法 chunk 大小: {size_line}"),
                        }))
                        .await;
                    return false;
                }
            };

            if size == 0 {
                // trailer 区读到空行为止
                loop {
                    if let Some(pos) = find_crlf(&self.residual) {
                        let line: Vec<u8> = self.residual.drain(..pos + 2).collect();
                        if pos == 0 {
                            return true;
                        }
                        let _ = line;
                    } else if !self.fill_residual(cancel).await {
                        return false;
                    }
                }
            }

            // chunk 数据
            let mut remaining = size;
            while remaining > 0 {
                if self.residual.is_empty() && !self.fill_residual(cancel).await {
                    return false;
                }
                let take = self.residual.len().min(remaining);
                let data: Vec<u8> = self.residual.drain(..take).collect();
                remaining -= take;
                if tx.send(Ok(Bytes::from(data))).await.is_err() {
                    return false;
                }
            }
            // 尾随 CRLF
            let mut crlf = 2usize;
            while crlf > 0 {
                if self.residual.is_empty() && !self.fill_residual(cancel).await {
                    return false;
                }
                let take = self.residual.len().min(crlf);
                self.residual.drain(..take);
                crlf -= take;
            }
        }
    }

    async fn fill_residual(&mut self, cancel: &CancelToken) -> bool {
        let mut buf = [0u8; 4096];
        let read = tokio::select! {
            _ = cancel.cancelled() => return false,
            r = self.stream.read(&mut buf) => r,
        };
        match read {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.residual.extend_from_slice(&buf[..n]);
                true
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    fn from_headers(headers: &[(String, String)]) -> Self {
        for (k, v) in headers {
            if k.eq_ignore_ascii_case("transfer-encoding")
                && v.to_ascii_lowercase().contains("chunked")
            {
                return BodyFraming::Chunked;
            }
        }
        for (k, v) in headers {
            if k.eq_ignore_ascii_case("content-length") {
                if let Ok(n) = v.trim().parse::<u64>() {
                    return if n == 0 { BodyFraming::None } else { BodyFraming::ContentLength(n) };
                }
            }
        }
        BodyFraming::UntilClose
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let status = response.code.unwrap_or(0);
            let headers = response
                .headers
                .iter()
                .map(|h| {
                    (h.name.to_string(), String::from_utf8_lossy(h.value).to_string())
                })
                .collect();
            Ok(Some((ResponseHead { status, headers }, consumed)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(Error::ProtocolError {
            protocol: Protocol::Http1,
            reason: format!("响应头解析失败: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_framing_priority() {
        let h = vec![
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Content-Length".to_string(), "10".to_string()),
        ];
        assert_eq!(BodyFraming::from_headers(&h), BodyFraming::Chunked);

        let h = vec![("Content-Length".to_string(), "10".to_string())];
        assert_eq!(BodyFraming::from_headers(&h), BodyFraming::ContentLength(10));

        assert_eq!(BodyFraming::from_headers(&[]), BodyFraming::UntilClose);
    }

    #[test]
    fn test_parse_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\nrest";
        let (head, consumed) = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.headers[0].0, "Content-Type");
        assert_eq!(&raw[consumed..], b"rest");
    }

    #[tokio::test]
    async fn test_request_roundtrip_content_length() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = conn.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(req.starts_with("GET /x HTTP/1.1\r\n"));
            // 头顺序按传入顺序逐字写出
            let host_at = req.find("Host:").unwrap();
            let ua_at = req.find("User-Agent:").unwrap();
            assert!(host_at < ua_at);
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let conn = H1Conn {
            stream: Box::new(tcp),
            origin: Origin::new(false, "127.0.0.1", addr.port()),
            created: Instant::now(),
            residual: Vec::new(),
        };
        let headers = vec![
            ("Host".to_string(), "127.0.0.1".to_string()),
            ("User-Agent".to_string(), "test".to_string()),
        ];
        let cancel = CancelToken::new();
        let (head, mut body, reuse) = conn
            .send_request("GET", "/x", &headers, &Body::Empty, &cancel)
            .await
            .unwrap();
        assert_eq!(head.status, 200);

        let mut collected = Vec::new();
        while let Some(chunk) = body.recv().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello");
        // 体排干后连接归还
        assert!(reuse.await.is_ok());
    }

    #[tokio::test]
    async fn test_chunked_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        });

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let conn = H1Conn {
            stream: Box::new(tcp),
            origin: Origin::new(false, "127.0.0.1", addr.port()),
            created: Instant::now(),
            residual: Vec::new(),
        };
        let cancel = CancelToken::new();
        let (head, mut body, reuse) = conn
            .send_request("GET", "/", &[("Host".to_string(), "x".to_string())], &Body::Empty, &cancel)
            .await
            .unwrap();
        assert_eq!(head.status, 200);
        let mut collected = Vec::new();
        while let Some(chunk) = body.recv().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello world");
        assert!(reuse.await.is_ok());
    }
}
