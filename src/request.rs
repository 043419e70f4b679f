//! HTTP 请求构建

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::headers::RequestContext;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }

    /// 幂等方法才有资格进 0-RTT 与状态码重试
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Options)
    }
}

/// 解析后的 URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub https: bool,
    pub host: String,
    pub port: u16,
    /// 含 query 的路径，恒以 `/` 开头
    pub path: String,
}

impl ParsedUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let (https, rest) = if let Some(stripped) = url.strip_prefix("https://") {
            (true, stripped)
        } else if let Some(stripped) = url.strip_prefix("http://") {
            (false, stripped)
        } else {
            return Err(Error::Configuration(format!("URL 缺少协议: {url}")));
        };

        let (host_port, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };
        // fragment 不上行
        let path = path.split('#').next().unwrap_or("/");

        let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
            // IPv6 字面量
            let (h, p) = rest
                .split_once(']')
                .ok_or_else(|| Error::Configuration(format!("非法 IPv6 主机: {url}")))?;
            let port = match p.strip_prefix(':') {
                Some(p) => {
                    p.parse().map_err(|_| Error::Configuration(format!("非法端口: {p}")))?
                }
                None => {
                    if https {
                        443
                    } else {
                        80
                    }
                }
            };
            (h.to_string(), port)
        } else {
            match host_port.rsplit_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    p.parse().map_err(|_| Error::Configuration(format!("非法端口: {p}")))?,
                ),
                None => (host_port.to_string(), if https { 443 } else { 80 }),
            }
        };
        if host.is_empty() {
            return Err(Error::Configuration(format!("URL 缺少主机: {url}")));
        }

        Ok(Self { https, host: host.to_ascii_lowercase(), port, path: path.to_string() })
    }

    pub fn origin(&self) -> crate::transport::Origin {
        crate::transport::Origin::new(self.https, self.host.clone(), self.port)
    }

    /// 不含 query 的路径（cookie path-match 用）
    pub fn path_only(&self) -> &str {
        self.path.split('?').next().unwrap_or("/")
    }

    pub fn to_url_string(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        let default = if self.https { 443 } else { 80 };
        if self.port == default {
            format!("{scheme}://{}{}", self.host, self.path)
        } else {
            format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
        }
    }

    /// 解析 Location（绝对 / 协议相对 / 绝对路径 / 相对路径）
    pub fn join_location(&self, location: &str) -> Result<ParsedUrl> {
        if location.starts_with("http://") || location.starts_with("https://") {
            ParsedUrl::parse(location)
        } else if let Some(rest) = location.strip_prefix("//") {
            let scheme = if self.https { "https" } else { "http" };
            ParsedUrl::parse(&format!("{scheme}://{rest}"))
        } else if location.starts_with('/') {
            let mut next = self.clone();
            next.path = location.to_string();
            Ok(next)
        } else {
            let base = match self.path_only().rsplit_once('/') {
                Some((dir, _)) => dir,
                None => "",
            };
            let mut next = self.clone();
            next.path = format!("{base}/{location}");
            Ok(next)
        }
    }
}

/// 请求体：内存字节或有界惰性流
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    /// 惰性流只能消费一次；重试时不可重放
    Stream(Arc<Mutex<Option<mpsc::Receiver<Bytes>>>>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            Body::Stream(_) => false,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream(_) => None,
        }
    }

    /// 重试只允许可重放的 body
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Body::Stream(_))
    }

    pub fn take_stream(&self) -> Option<mpsc::Receiver<Bytes>> {
        match self {
            Body::Stream(slot) => slot.lock().expect("body stream poisoned").take(),
            _ => None,
        }
    }
}

/// HTTP 请求
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    /// 显式头，保持插入顺序
    pub headers: Vec<(String, String)>,
    pub body: Body,
    /// 覆盖会话级超时
    pub timeout: Option<Duration>,
    /// 省缺时由引擎按方法推导（GET→导航 / 其它→xhr）
    pub context: Option<RequestContext>,
    /// 非幂等方法显式放行 0-RTT
    pub allow_early_data: bool,
    pub cancel: CancelToken,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            body: Body::Empty,
            timeout: None,
            context: None,
            allow_early_data: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    pub fn with_json_body(mut self, json: &str) -> Self {
        self.headers.push(("Content-Type".to_string(), "application/json".to_string()));
        self.body = Body::Bytes(Bytes::copy_from_slice(json.as_bytes()));
        self
    }

    pub fn with_body_stream(mut self, rx: mpsc::Receiver<Bytes>) -> Self {
        self.body = Body::Stream(Arc::new(Mutex::new(Some(rx))));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 非幂等方法也允许进 0-RTT（调用方自担重放风险）
    pub fn with_early_data(mut self) -> Self {
        self.allow_early_data = true;
        self
    }
}
