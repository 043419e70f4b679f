//! HTTP/2 拨号器与连接
//!
//! 与 H1 共用 TCP+TLS 建立（ALPN 换成 h2），随后用 h2 crate 完成
//! preface 与 SETTINGS：条目值取自 preset 的 `H2Spec`，HPACK 动态表
//! 大小同源。连接级 WINDOW_UPDATE 通过连接窗口增量配置发出。
//! SETTINGS 的 wire 顺序与独立 PRIORITY 帧由 h2 内部掌控，
//! 前导字节基线由 `H2Spec::preamble_bytes` 单独校验。
//! 握手期间绝不持有池锁：池侧先占位，握手完成后再补位。

use super::h1::{dial_stream, ResponseHead};
use super::{DialConfig, Origin};
use crate::cancel::CancelToken;
use crate::error::{Error, Protocol, Result};
use crate::preset::H2Setting;
use crate::request::Body;
use bytes::Bytes;
use log::{debug, warn};
use std::time::Instant;
use tokio::sync::mpsc;

/// 已就绪的 HTTP/2 连接句柄（克隆即多路复用同一连接）
#[derive(Clone)]
pub struct H2Handle {
    send: h2::client::SendRequest<Bytes>,
    pub origin: Origin,
    pub created: Instant,
}

/// 拨号：TLS(ALPN h2) → preface/SETTINGS → 可复用句柄
pub async fn dial(origin: &Origin, config: &DialConfig, cancel: &CancelToken) -> Result<H2Handle> {
    let stream = dial_stream(origin, config, cancel, Protocol::Http2).await?;

    let spec = &config.preset.h2;
    let mut builder = h2::client::Builder::new();
    builder
        .initial_window_size(spec.initial_window_size())
        .initial_connection_window_size(spec.connection_window_update + 65535)
        .header_table_size(spec.header_table_size())
        .enable_push(spec.enable_push());
    if let Some(max) = spec.max_header_list_size() {
        builder.max_header_list_size(max);
    }
    if let Some((_, v)) = spec.settings.iter().find(|(k, _)| *k == H2Setting::MaxFrameSize.as_u16())
    {
        builder.max_frame_size(*v);
    }

    let handshake = async {
        builder.handshake::<_, Bytes>(stream).await.map_err(|e| {
            if e.is_go_away() || e.is_reset() {
                Error::Http2PrefaceRejected { origin: origin.key() }
            } else {
                Error::ProtocolError { protocol: Protocol::Http2, reason: e.to_string() }
            }
        })
    };
    let (send, connection) = cancel.guard(handshake).await?;

    // 连接驱动在后台跑完整个生命周期
    let origin_key = origin.key();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("h2 connection {origin_key} closed: {e}");
        }
    });

    Ok(H2Handle { send, origin: origin.clone(), created: Instant::now() })
}

impl H2Handle {
    /// 发送请求并返回响应头与体分块流
    pub async fn send_request(
        &mut self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: &Body,
        cancel: &CancelToken,
    ) -> Result<(ResponseHead, mpsc::Receiver<Result<Bytes>>)> {
        let ready = async {
            self.send
                .clone()
                .ready()
                .await
                .map_err(|e| Error::ProtocolError { protocol: Protocol::Http2, reason: e.to_string() })
        };
        let mut send = cancel.guard(ready).await?;

        let uri = format!("https://{}{}", self.origin.authority(), path);
        let mut request = http::Request::builder()
            .method(method)
            .uri(&uri)
            .version(http::Version::HTTP_2);
        for (k, v) in headers {
            request = request.header(k.as_str(), v.as_str());
        }
        let request = request
            .body(())
            .map_err(|e| Error::Configuration(format!("请求构建失败: {e}")))?;

        let end_of_stream = body.is_empty();
        let (response_fut, send_stream) = send
            .send_request(request, end_of_stream)
            .map_err(|e| Error::ProtocolError { protocol: Protocol::Http2, reason: e.to_string() })?;

        if !end_of_stream {
            send_body(send_stream, body, cancel).await?;
        }

        let response = cancel
            .guard(async {
                response_fut.await.map_err(|e| Error::ProtocolError {
                    protocol: Protocol::Http2,
                    reason: e.to_string(),
                })
            })
            .await?;

        let status = response.status().as_u16();
        let mut head_headers = Vec::new();
        for (k, v) in response.headers() {
            if let Ok(value) = v.to_str() {
                head_headers.push((k.as_str().to_string(), value.to_string()));
            }
        }

        // 体排干任务：流控窗口随消费释放
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(16);
        let mut recv_stream = response.into_body();
        let drain_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut delivered: u64 = 0;
            loop {
                let chunk = tokio::select! {
                    _ = drain_cancel.cancelled() => break,
                    c = recv_stream.data() => c,
                };
                match chunk {
                    Some(Ok(data)) => {
                        let _ = recv_stream.flow_control().release_capacity(data.len());
                        delivered += data.len() as u64;
                        if tx.send(Ok(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(Error::BodyReadFailed {
                                bytes_delivered: delivered,
                                source: std::io::Error::other(e),
                            }))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok((ResponseHead { status, headers: head_headers }, rx))
    }
}

/// 按流控容量分片发送请求体
async fn send_body(
    mut stream: h2::SendStream<Bytes>,
    body: &Body,
    cancel: &CancelToken,
) -> Result<()> {
    let mut pending: Bytes = match body {
        Body::Bytes(b) => b.clone(),
        Body::Empty => Bytes::new(),
        Body::Stream(_) => {
            // 惰性流：逐块进入同一条容量循环
            let mut rx = body.take_stream().ok_or_else(|| {
                Error::Configuration("流式请求体已被消费，无法重放".to_string())
            })?;
            let mut all = Vec::new();
            while let Some(chunk) = rx.recv().await {
                all.extend_from_slice(&chunk);
            }
            Bytes::from(all)
        }
    };

    while !pending.is_empty() {
        stream.reserve_capacity(pending.len());
        let granted = cancel
            .guard(async {
                futures::future::poll_fn(|cx| stream.poll_capacity(cx))
                    .await
                    .transpose()
                    .map_err(|e| Error::BodyWriteFailed { source: std::io::Error::other(e) })
            })
            .await?;
        let granted = match granted {
            Some(n) if n > 0 => n,
            Some(_) => continue,
            None => {
                warn!("h2 send stream closed before body finished");
                return Err(Error::BodyWriteFailed {
                    source: std::io::ErrorKind::BrokenPipe.into(),
                });
            }
        };
        let chunk = pending.split_to(granted.min(pending.len()));
        stream
            .send_data(chunk, false)
            .map_err(|e| Error::BodyWriteFailed { source: std::io::Error::other(e) })?;
    }
    stream
        .send_data(Bytes::new(), true)
        .map_err(|e| Error::BodyWriteFailed { source: std::io::Error::other(e) })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::lookup;

    #[test]
    fn test_builder_values_from_preset() {
        // 构建参数全部取自 preset 的 H2Spec
        let preset = lookup("chrome-143").unwrap();
        assert_eq!(preset.h2.initial_window_size(), 6_291_456);
        assert_eq!(preset.h2.header_table_size(), 65536);
        assert_eq!(preset.h2.connection_window_update, 15_663_105);
        assert!(!preset.h2.enable_push());
    }

    #[test]
    fn test_firefox_max_frame_size_present() {
        let preset = lookup("firefox-133").unwrap();
        let max_frame = preset
            .h2
            .settings
            .iter()
            .find(|(k, _)| *k == H2Setting::MaxFrameSize.as_u16());
        assert_eq!(max_frame, Some(&(H2Setting::MaxFrameSize.as_u16(), 16384)));
    }
}
