//! 代理协商行为
//!
//! 对着本地 stub 代理验证：预写式 CONNECT 在 407 上的一次性降级
//! 重试、顺序式 CONNECT 的错误面、SOCKS5 UDP 头的字节往返。

use cloak::proxy::socks5::{encode_udp_header, parse_udp_header};
use cloak::{Error, Protocol, Session};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// 常驻 stub 代理：所有 CONNECT 一律 407，并统计连接次数
async fn spawn_407_proxy() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else { break };
            hits2.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = conn.read(&mut buf).await;
                let _ = conn
                    .write_all(b"HTTP/1.1 407 Proxy Auth Required\r\n\r\n")
                    .await;
            });
        }
    });
    (addr, hits)
}

#[tokio::test]
async fn test_speculative_407_retries_sequential_then_surfaces() {
    let (addr, hits) = spawn_407_proxy().await;

    let session = Session::builder("chrome-143")
        .proxy(&format!("http://{addr}"))
        .http_version(Protocol::Http2)
        .max_retries(0)
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .unwrap();

    let err = session.get("https://example.test/").await.unwrap_err();

    // 第一枪预写式失败后拉黑重试，第二枪顺序式仍 407，按代理协商失败上浮
    match &err {
        Error::ProxyNegotiationFailed { status, auth_required, .. } => {
            assert_eq!(*status, Some(407));
            assert!(auth_required);
        }
        other => panic!("expected ProxyNegotiationFailed, got {other}"),
    }
    assert!(!err.is_retriable());
    assert!(err.hint().unwrap().contains("Proxy-Authorization"));
    assert_eq!(hits.load(Ordering::SeqCst), 2, "预写一次 + 顺序一次");

    session.close().await;
}

#[tokio::test]
async fn test_sequential_connect_200_tunnels() {
    // stub 代理放行 CONNECT 后原样回显隧道字节
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let mut acc = Vec::new();
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            acc.extend_from_slice(&buf[..n]);
            if acc.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        assert!(acc.starts_with(b"CONNECT target.test:443 HTTP/1.1\r\n"));
        conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        conn.write_all(&buf[..n]).await.unwrap();
    });

    let proxy = cloak::proxy::ProxyConfig::parse(&format!("http://{addr}")).unwrap();
    let mut tunnel = cloak::proxy::dial_tcp(&proxy, "target.test", 443, std::time::Duration::from_secs(2))
        .await
        .unwrap();
    tunnel.write_all(b"ping").await.unwrap();
    let mut out = [0u8; 4];
    tunnel.read_exact(&mut out).await.unwrap();
    assert_eq!(&out, b"ping");
}

#[test]
fn test_socks5_udp_header_fixture_roundtrip() {
    let addr: std::net::SocketAddr = "1.2.3.4:443".parse().unwrap();
    let header = encode_udp_header(addr);
    assert_eq!(header, [0x00, 0x00, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x01, 0xbb]);

    let mut packet = header;
    packet.extend_from_slice(b"quic-initial");
    let (offset, parsed) = parse_udp_header(&packet).unwrap();
    assert_eq!(offset, 10);
    assert_eq!(parsed, addr);
    assert_eq!(&packet[offset..], b"quic-initial");
}

#[test]
fn test_socks5_udp_frag_refused() {
    let mut packet = encode_udp_header("1.2.3.4:443".parse().unwrap());
    packet[2] = 0x02;
    assert!(parse_udp_header(&packet).is_err());
}
