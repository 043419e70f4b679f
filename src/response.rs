//! HTTP 响应
//!
//! 响应体两种形态：已整体物化的缓冲（从缓冲池软上限以内取），
//! 或惰性分块流（超上限、或调用方要求流式）。
//! 整体读取时按 Content-Encoding 透明解码 gzip/deflate/br；
//! 流式分块不做解码，原始字节直接交给调用方。

use crate::error::{Error, Protocol, Result};
use bytes::Bytes;
use std::io::Read;
use std::time::Duration;
use tokio::sync::mpsc;

/// 物化缓冲的软上限；超过则强制流式
pub const BUFFER_SOFT_CAP: usize = 16 * 1024 * 1024;

/// 单请求耗时分解
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    pub dns: Option<Duration>,
    pub connect: Option<Duration>,
    pub tls: Option<Duration>,
    pub first_byte: Option<Duration>,
    pub total: Duration,
}

/// 响应体
pub enum ResponseBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Result<Bytes>>),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// HTTP 响应
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    /// 响应头，保持到达顺序
    pub headers: Vec<(String, String)>,
    /// 实际承载协议
    pub protocol: Protocol,
    /// 重定向后最终 URL
    pub final_url: String,
    /// 途经的重定向 URL
    pub redirect_history: Vec<String>,
    pub timing: Timing,
    pub body: ResponseBody,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 4xx/5xx 转为类型化错误，其余原样返回
    pub fn error_for_status(self) -> Result<Self> {
        if self.status >= 400 {
            Err(Error::HttpStatus { status: self.status })
        } else {
            Ok(self)
        }
    }

    /// 第一个同名响应头（大小写不敏感）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 所有同名响应头（Set-Cookie 用）
    pub fn headers_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// 流式下取下一块；Full 形态返回 None（用 `bytes()`）
    pub async fn chunk(&mut self) -> Option<Result<Bytes>> {
        match &mut self.body {
            ResponseBody::Stream(rx) => rx.recv().await,
            ResponseBody::Full(_) => None,
        }
    }

    /// 整体取出响应体并按 Content-Encoding 解码
    pub async fn bytes(mut self) -> Result<Bytes> {
        let raw: Bytes = match self.body {
            ResponseBody::Full(b) => b,
            ResponseBody::Stream(ref mut rx) => {
                let mut buf = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk?);
                }
                Bytes::from(buf)
            }
        };

        let encoding = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-encoding"))
            .map(|(_, v)| v.to_ascii_lowercase());

        decode_body(raw, encoding.as_deref())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Configuration(format!("响应体不是合法 UTF-8: {e}")))
    }

    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Configuration(format!("响应体 JSON 解析失败: {e}")))
    }
}

fn decode_body(raw: Bytes, encoding: Option<&str>) -> Result<Bytes> {
    match encoding {
        Some("gzip") => {
            let mut out = Vec::with_capacity(raw.len() * 4);
            flate2::read::GzDecoder::new(raw.as_ref())
                .read_to_end(&mut out)
                .map_err(|e| Error::BodyReadFailed { bytes_delivered: 0, source: e })?;
            Ok(Bytes::from(out))
        }
        Some("deflate") => {
            let mut out = Vec::with_capacity(raw.len() * 4);
            flate2::read::ZlibDecoder::new(raw.as_ref())
                .read_to_end(&mut out)
                .map_err(|e| Error::BodyReadFailed { bytes_delivered: 0, source: e })?;
            Ok(Bytes::from(out))
        }
        Some("br") => {
            let mut out = Vec::with_capacity(raw.len() * 4);
            brotli_decompressor::Decompressor::new(raw.as_ref(), 4096)
                .read_to_end(&mut out)
                .map_err(|e| Error::BodyReadFailed { bytes_delivered: 0, source: e })?;
            Ok(Bytes::from(out))
        }
        _ => Ok(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(headers: Vec<(String, String)>, body: ResponseBody) -> Response {
        Response {
            status: 200,
            headers,
            protocol: Protocol::Http2,
            final_url: "https://example.test/".to_string(),
            redirect_history: Vec::new(),
            timing: Timing::default(),
            body,
        }
    }

    #[tokio::test]
    async fn test_bytes_plain() {
        let r = response_with(vec![], ResponseBody::Full(Bytes::from_static(b"hello")));
        assert_eq!(r.bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_bytes_gzip() {
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"compressed payload").unwrap();
        let gz = enc.finish().unwrap();

        let r = response_with(
            vec![("Content-Encoding".to_string(), "gzip".to_string())],
            ResponseBody::Full(Bytes::from(gz)),
        );
        assert_eq!(r.bytes().await.unwrap(), Bytes::from_static(b"compressed payload"));
    }

    #[tokio::test]
    async fn test_stream_drains_into_bytes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"part1-"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"part2"))).await.unwrap();
        drop(tx);

        let r = response_with(vec![], ResponseBody::Stream(rx));
        assert_eq!(r.bytes().await.unwrap(), Bytes::from_static(b"part1-part2"));
    }

    #[tokio::test]
    async fn test_chunk_streaming() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"a"))).await.unwrap();
        drop(tx);
        let mut r = response_with(vec![], ResponseBody::Stream(rx));
        assert_eq!(r.chunk().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert!(r.chunk().await.is_none());
    }

    #[test]
    fn test_error_for_status() {
        let mut r = response_with(vec![], ResponseBody::Full(Bytes::new()));
        r.status = 503;
        let err = r.error_for_status().unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 503 }));
        assert!(err.is_retriable());

        let ok = response_with(vec![], ResponseBody::Full(Bytes::new()));
        assert!(ok.error_for_status().is_ok());
    }

    #[test]
    fn test_headers_all() {
        let r = response_with(
            vec![
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ],
            ResponseBody::Full(Bytes::new()),
        );
        assert_eq!(r.headers_all("set-cookie"), vec!["a=1", "b=2"]);
    }
}
