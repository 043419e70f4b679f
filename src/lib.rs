//! # cloak
//!
//! 一个浏览器指纹级 HTTP 客户端库：从 TLS ClientHello（JA3/JA4）、
//! HTTP/2 连接前导（Akamai 指纹）、HTTP/3 QUIC 传输参数到请求头的
//! 形状、顺序与取值，全链路逐字节对齐真实浏览器。
//!
//! ## 特性
//!
//! - ✅ **preset 目录**：Chrome 143（桌面三平台）、Chrome 131、Firefox 133、
//!   Safari 18 与移动端变体，`<family>-latest` 别名构建期解析
//! - ✅ **头一致性引擎**：Accept / Sec-Fetch-* / client hints 随请求上下文联动
//! - ✅ **三协议拨号**：H1 / H2 / H3，共享拨号前奏（Happy Eyeballs、每地址预算）
//! - ✅ **协议竞速**：H3 对 H2 带 ~200ms 领先量竞速，败者协同取消，结果进提示表
//! - ✅ **代理基座**：HTTP CONNECT（含预写式 TLS）、SOCKS5 TCP/UDP、MASQUE，
//!   HTTP/3 可跑在任意一种之上
//! - ✅ **会话运行时**：cookie jar、TLS 票据缓存（可挂共享后端）、
//!   refresh / warmup / fork / save / load
//! - ✅ **0-RTT**：票据命中后幂等方法首飞 early data
//! - ✅ **类型化错误**：可重试性、指纹可疑信号与纠正提示全在错误面上

pub mod cancel;
pub mod cookies;
pub mod dicttls;
pub mod engine;
pub mod error;
pub mod headers;
pub mod keylog;
pub mod preset;
pub mod proxy;
pub mod request;
pub mod response;
pub mod session;
pub mod state;
pub mod tickets;
pub mod transport;
pub mod warmup;

pub use cancel::CancelToken;
pub use cookies::{Cookie, CookieJar, SameSite};
pub use error::{Error, Protocol, Result};
pub use headers::{FetchDest, FetchMode, FetchSite, RequestContext};
pub use keylog::KeyLogSink;
pub use preset::{available as available_presets, lookup as lookup_preset, Preset};
pub use request::{Body, Method, ParsedUrl, Request};
pub use response::{Response, ResponseBody, Timing};
pub use session::{Session, SessionBuilder, SessionOptions};
pub use state::{SessionState, STATE_VERSION};
pub use tickets::{TicketBackend, TicketCache, TicketRecord};
pub use transport::pool::PoolStats;
pub use transport::tls::CertPin;
