//! 错误类型定义
//!
//! 全部错误携带操作标签与可选的底层原因，调用方按 `is_retriable` /
//! `is_fatal` 决定是否在重试预算内继续。重试循环只存在于请求引擎与
//! 协议仲裁器，拨号器内部从不重试。

use std::io;
use std::time::Duration;
use thiserror::Error;

/// 协议类别（错误分类与仲裁器共用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Http1,
    Http2,
    Http3,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
            Protocol::Http3 => "h3",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 客户端错误
#[derive(Debug, Error)]
pub enum Error {
    /// DNS 解析失败（可跨地址重试）
    #[error("DNS 解析失败: {host}")]
    DnsFailed {
        host: String,
        #[source]
        source: Option<io::Error>,
    },

    /// TCP 拨号失败（可换下一地址重试）
    #[error("TCP 连接失败: {addr}")]
    DialTcpFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// UDP 拨号失败
    #[error("UDP 连接失败: {addr}")]
    DialUdpFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 代理协商失败；带认证要求时为致命错误
    #[error("代理协商失败: {reason}{}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    ProxyNegotiationFailed {
        reason: String,
        status: Option<u16>,
        auth_required: bool,
    },

    /// TLS 握手失败；特定告警额外标记指纹可疑
    #[error("TLS 握手失败: {op}")]
    TlsHandshakeFailed {
        op: &'static str,
        alert: Option<u8>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// 证书指纹固定校验失败（致命，不重试）
    #[error("证书 pin 校验失败: {host}")]
    CertificatePinMismatch { host: String },

    /// 服务端拒绝 HTTP/2 preface（重试一次后仲裁器倾向 H1）
    #[error("HTTP/2 preface 被拒绝: {origin}")]
    Http2PrefaceRejected { origin: String },

    /// HTTP/3 不可用（UDP 被阻断或握手超时），源站进入 H3 冷却
    #[error("HTTP/3 不可用: {origin}: {reason}")]
    Http3Unavailable { origin: String, reason: String },

    /// 预写式 TLS（CONNECT 与 ClientHello 合并发送）阶段错误；
    /// 触发对该 (代理, 协议) 关闭预写后重试一次
    #[error("speculative TLS 失败: op={op}{}", status.map(|s| format!(" status={s}")).unwrap_or_default())]
    SpeculativeTls {
        op: &'static str,
        status: Option<u16>,
        #[source]
        source: Option<io::Error>,
    },

    /// HTTP 状态码错误（仅对幂等方法与特定状态码重试）
    #[error("HTTP 状态码 {status}")]
    HttpStatus { status: u16 },

    /// 请求体写入失败
    #[error("请求体写入失败")]
    BodyWriteFailed {
        #[source]
        source: io::Error,
    },

    /// 响应体读取失败；已向调用方交付过字节后不再重试
    #[error("响应体读取失败")]
    BodyReadFailed {
        bytes_delivered: u64,
        #[source]
        source: io::Error,
    },

    /// 调用方取消（终止，不重试）
    #[error("请求已取消")]
    Cancelled,

    /// 截止时间已到（终止，不重试）
    #[error("截止时间已到 ({0:?})")]
    DeadlineExceeded(Duration),

    /// 配置错误：非法 URL、未知 preset、互斥选项（致命）
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 会话状态 blob 版本不被接受
    #[error("会话状态版本不支持: {found} (当前 {supported})")]
    StateVersion { found: u32, supported: u32 },

    /// 协议层错误（h2/h3/QUIC 内部错误的包装）
    #[error("{protocol} 协议错误: {reason}")]
    ProtocolError { protocol: Protocol, reason: String },

    /// 重定向次数超限
    #[error("重定向次数超过限制: {0}")]
    TooManyRedirects(usize),

    /// IO 错误兜底
    #[error("IO 错误")]
    Io(#[from] io::Error),
}

impl Error {
    /// 该错误是否允许请求引擎在预算内重试
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::DnsFailed { .. }
            | Error::DialTcpFailed { .. }
            | Error::DialUdpFailed { .. }
            | Error::Http2PrefaceRejected { .. }
            | Error::Http3Unavailable { .. }
            | Error::SpeculativeTls { .. }
            | Error::ProtocolError { .. } => true,
            Error::TlsHandshakeFailed { .. } => true,
            Error::ProxyNegotiationFailed { auth_required, .. } => !auth_required,
            Error::HttpStatus { status } => {
                matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
            }
            Error::BodyWriteFailed { .. } => true,
            Error::BodyReadFailed { bytes_delivered, .. } => *bytes_delivered == 0,
            _ => false,
        }
    }

    /// 终止类错误：取消与超时永不重试，也不计入冷却统计
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded(_))
    }

    /// 握手失败是否暗示 preset 指纹被服务端识别拒绝
    pub fn is_fingerprint_suspect(&self) -> bool {
        match self {
            Error::TlsHandshakeFailed { alert: Some(a), .. } => {
                crate::dicttls::is_fingerprint_suspect_alert(*a)
            }
            _ => false,
        }
    }

    /// 给出纠正建议（有则附在错误展示之后）
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::ProxyNegotiationFailed { status: Some(407), .. } => Some(
                "proxy rejected CONNECT with 407; set Proxy-Authorization or a proxy URL with credentials",
            ),
            Error::Http3Unavailable { .. } => {
                Some("UDP/QUIC may be blocked on this network; the origin is pinned to h2 for the cooldown window")
            }
            Error::CertificatePinMismatch { .. } => {
                Some("certificate pin mismatch is fatal; update the pin set if the origin rotated keys")
            }
            _ if self.is_fingerprint_suspect() => {
                Some("the server may be rejecting this TLS fingerprint; try another preset")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(Error::HttpStatus { status: 503 }.is_retriable());
        assert!(!Error::HttpStatus { status: 404 }.is_retriable());
        assert!(!Error::Cancelled.is_retriable());
        assert!(Error::Cancelled.is_terminal());
        assert!(!Error::Configuration("bad".into()).is_retriable());
    }

    #[test]
    fn test_proxy_auth_fatal() {
        let e = Error::ProxyNegotiationFailed {
            reason: "407".into(),
            status: Some(407),
            auth_required: true,
        };
        assert!(!e.is_retriable());
        assert!(e.hint().unwrap().contains("Proxy-Authorization"));
    }

    #[test]
    fn test_fingerprint_suspect() {
        let e = Error::TlsHandshakeFailed {
            op: "client_hello",
            alert: Some(crate::dicttls::ALERT_HANDSHAKE_FAILURE),
            source: None,
        };
        assert!(e.is_fingerprint_suspect());
    }

    #[test]
    fn test_body_read_after_delivery_not_retriable() {
        let e = Error::BodyReadFailed {
            bytes_delivered: 10,
            source: std::io::Error::other("reset"),
        };
        assert!(!e.is_retriable());
    }
}
