//! 会话运行时
//!
//! 会话持有 cookie jar、TLS 票据缓存、协议仲裁提示与代理槽位，
//! 支撑 `refresh` / `warmup` / `fork` / `save` / `load` 生命周期。
//! fork 出的兄弟会话共享 jar 与票据缓存（内部共享所有权），
//! 连接池与仲裁提示各自独立；父会话关闭时连带关闭子会话，
//! 子会话关闭不影响父。会话可被多个并发操作同时使用。

use crate::cancel::CancelToken;
use crate::cookies::{Cookie, CookieJar};
use crate::error::{Error, Protocol, Result};
use crate::keylog::KeyLogSink;
use crate::preset::{self, Preset};
use crate::proxy::ProxyConfig;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::state::{SessionState, STATE_VERSION};
use crate::tickets::{BackendErrorHook, TicketBackend, TicketCache};
use crate::transport::arbiter::Arbiter;
use crate::transport::pool::{Pool, PoolConfig, PoolKey};
use crate::transport::tls::CertPin;
use crate::transport::{DialConfig, Origin};
use bytes::Bytes;
use log::debug;
use rand::Rng;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// 会话级选项（builder 的封闭选项集）
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub allow_redirects: bool,
    pub max_redirects: usize,
    pub max_retries: usize,
    pub verify_tls: bool,
    /// 只借 TLS 指纹，不注入模板头
    pub tls_only: bool,
    pub local_bind: Option<IpAddr>,
    pub cert_pins: Vec<CertPin>,
    /// 共享票据后端里的隔离键
    pub session_identifier: Option<String>,
    /// domain → base64 ECH 配置覆盖
    pub ech_overrides: HashMap<String, String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            allow_redirects: true,
            max_redirects: 10,
            max_retries: 2,
            verify_tls: true,
            tls_only: false,
            local_bind: None,
            cert_pins: Vec::new(),
            session_identifier: None,
            ech_overrides: HashMap::new(),
        }
    }
}

struct ProxySlots {
    tcp: Option<ProxyConfig>,
    udp: Option<ProxyConfig>,
}

/// 会话内部状态（engine 的工作视图）
pub(crate) struct SessionCore {
    pub preset: Arc<Preset>,
    pub jar: CookieJar,
    pub tickets: TicketCache,
    pub pool: Pool,
    pub arbiter: Arbiter,
    pub options: SessionOptions,
    proxies: RwLock<ProxySlots>,
    forced: RwLock<Option<Protocol>>,
    keylog: RwLock<Option<Arc<KeyLogSink>>>,
    session_seed: u64,
    closed: AtomicBool,
    /// fork 出的子会话；父关闭连带关闭
    children: Mutex<Vec<Arc<SessionCore>>>,
}

impl SessionCore {
    pub(crate) fn tcp_proxy(&self) -> Option<ProxyConfig> {
        self.proxies.read().expect("proxy slots poisoned").tcp.clone()
    }

    pub(crate) fn udp_proxy(&self) -> Option<ProxyConfig> {
        self.proxies.read().expect("proxy slots poisoned").udp.clone()
    }

    /// UDP 面可用：无代理，或代理能承载 UDP
    pub(crate) fn udp_available(&self) -> bool {
        match self.udp_proxy() {
            None => true,
            Some(p) => !matches!(p.scheme, crate::proxy::ProxyScheme::Http),
        }
    }

    pub(crate) fn forced_protocol(&self) -> Option<Protocol> {
        *self.forced.read().expect("forced slot poisoned")
    }

    pub(crate) fn pool_key(&self, origin: &Origin, protocol: Protocol) -> PoolKey {
        let proxy = match protocol {
            Protocol::Http3 => self.udp_proxy().map(|p| p.pool_key()),
            _ => self.tcp_proxy().map(|p| p.pool_key()),
        };
        PoolKey {
            origin: origin.key(),
            protocol,
            preset: self.preset.name.to_string(),
            proxy,
            session_id: self.options.session_identifier.clone(),
        }
    }

    pub(crate) fn dial_config(&self, protocol: Protocol) -> DialConfig {
        let tcp_proxy = self.tcp_proxy();
        let speculative_disabled = tcp_proxy
            .as_ref()
            .map(|p| self.arbiter.speculative_blocked(&p.pool_key(), protocol))
            .unwrap_or(false);
        DialConfig {
            preset: self.preset.clone(),
            tcp_proxy,
            udp_proxy: self.udp_proxy(),
            verify_tls: self.options.verify_tls,
            keylog: self.keylog.read().expect("keylog slot poisoned").clone(),
            tickets: self.tickets.clone(),
            cert_pins: self.options.cert_pins.clone(),
            local_bind: self.options.local_bind,
            connect_timeout: self.options.connect_timeout,
            session_seed: self.session_seed,
            session_id: self.options.session_identifier.clone(),
            speculative_disabled,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let children: Vec<Arc<SessionCore>> =
            self.children.lock().expect("children poisoned").drain(..).collect();
        for child in children {
            Box::pin(child.close()).await;
        }
        self.pool.close_all().await;
    }

    fn assert_open(&self) {
        // 关闭后继续使用属于调用方编程错误
        assert!(!self.closed.load(Ordering::SeqCst), "session used after close()");
    }
}

/// 会话构建器
pub struct SessionBuilder {
    preset: String,
    options: SessionOptions,
    tcp_proxy: Option<String>,
    udp_proxy: Option<String>,
    forced: Option<Protocol>,
    keylog: Option<Arc<KeyLogSink>>,
    ticket_backend: Option<(Arc<dyn TicketBackend>, BackendErrorHook)>,
}

impl SessionBuilder {
    pub fn new(preset: &str) -> Self {
        Self {
            preset: preset.to_string(),
            options: SessionOptions::default(),
            tcp_proxy: None,
            udp_proxy: None,
            forced: None,
            keylog: KeyLogSink::from_env(),
            ticket_backend: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.options.allow_redirects = allow;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.options.max_redirects = max;
        self
    }

    pub fn max_retries(mut self, max: usize) -> Self {
        self.options.max_retries = max;
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.options.verify_tls = verify;
        self
    }

    /// TCP 面代理（http/socks5/socks5h）
    pub fn proxy(mut self, url: &str) -> Self {
        self.tcp_proxy = Some(url.to_string());
        self
    }

    /// UDP 面代理（socks5/masque），与 TCP 槽独立
    pub fn udp_proxy(mut self, url: &str) -> Self {
        self.udp_proxy = Some(url.to_string());
        self
    }

    /// 固定 HTTP 版本（auto 即不调用）
    pub fn http_version(mut self, protocol: Protocol) -> Self {
        self.forced = Some(protocol);
        self
    }

    pub fn key_log_sink(mut self, sink: Arc<KeyLogSink>) -> Self {
        self.keylog = Some(sink);
        self
    }

    pub fn local_bind_address(mut self, addr: IpAddr) -> Self {
        self.options.local_bind = Some(addr);
        self
    }

    pub fn cert_pins(mut self, pins: Vec<CertPin>) -> Self {
        self.options.cert_pins = pins;
        self
    }

    pub fn ech_config_override(mut self, domain: &str, config_base64: &str) -> Self {
        self.options.ech_overrides.insert(domain.to_string(), config_base64.to_string());
        self
    }

    pub fn tls_only(mut self, tls_only: bool) -> Self {
        self.options.tls_only = tls_only;
        self
    }

    pub fn session_identifier(mut self, id: &str) -> Self {
        self.options.session_identifier = Some(id.to_string());
        self
    }

    pub fn ticket_backend(
        mut self,
        backend: Arc<dyn TicketBackend>,
        on_error: BackendErrorHook,
    ) -> Self {
        self.ticket_backend = Some((backend, on_error));
        self
    }

    pub fn build(self) -> Result<Session> {
        let preset = preset::lookup(&self.preset)?;
        let tcp = self.tcp_proxy.as_deref().map(ProxyConfig::parse).transpose()?;
        let udp = self.udp_proxy.as_deref().map(ProxyConfig::parse).transpose()?;
        if let Some(p) = &udp {
            if matches!(p.scheme, crate::proxy::ProxyScheme::Http) {
                return Err(Error::Configuration(
                    "UDP 槽不接受 http 代理（需要 socks5/masque）".to_string(),
                ));
            }
        }

        let tickets = TicketCache::new();
        if let Some((backend, on_error)) = self.ticket_backend {
            tickets.register_backend(backend, on_error);
        }

        let core = Arc::new(SessionCore {
            preset,
            jar: CookieJar::new(),
            tickets,
            pool: Pool::new(PoolConfig::default()),
            arbiter: Arbiter::new(),
            options: self.options,
            proxies: RwLock::new(ProxySlots { tcp, udp }),
            forced: RwLock::new(self.forced),
            keylog: RwLock::new(self.keylog),
            session_seed: rand::thread_rng().gen(),
            closed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        });
        Ok(Session { core })
    }
}

/// 浏览器指纹会话
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// 以指定 preset 建会话（默认选项）
    pub fn new(preset: &str) -> Result<Self> {
        SessionBuilder::new(preset).build()
    }

    pub fn builder(preset: &str) -> SessionBuilder {
        SessionBuilder::new(preset)
    }

    pub fn preset_name(&self) -> &'static str {
        self.core.preset.name
    }

    // ---- 请求 ----

    pub async fn request(&self, request: Request) -> Result<Response> {
        self.core.assert_open();
        crate::engine::execute(&self.core, request).await
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Request::new(Method::Get, url)).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        self.request(Request::new(Method::Post, url).with_body(body)).await
    }

    pub async fn put(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        self.request(Request::new(Method::Put, url).with_body(body)).await
    }

    pub async fn patch(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        self.request(Request::new(Method::Patch, url).with_body(body)).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.request(Request::new(Method::Delete, url)).await
    }

    pub async fn head(&self, url: &str) -> Result<Response> {
        self.request(Request::new(Method::Head, url)).await
    }

    pub async fn options(&self, url: &str) -> Result<Response> {
        self.request(Request::new(Method::Options, url)).await
    }

    // ---- cookie ----

    pub fn set_cookie(&self, name: &str, value: &str, domain: &str, path: Option<&str>) {
        self.core.assert_open();
        let mut cookie = Cookie::new(name, value, domain);
        if let Some(p) = path {
            cookie.path = p.to_string();
        }
        self.core.jar.set(cookie);
    }

    pub fn get_cookies(&self) -> Vec<Cookie> {
        self.core.jar.all()
    }

    // ---- 代理 ----

    /// 原子替换代理槽；None 保持现状，Some("") 清空
    pub fn set_proxy(&self, tcp: Option<&str>, udp: Option<&str>) -> Result<()> {
        self.core.assert_open();
        let parse_slot = |v: Option<&str>| -> Result<Option<Option<ProxyConfig>>> {
            match v {
                None => Ok(None),
                Some("") => Ok(Some(None)),
                Some(url) => Ok(Some(Some(ProxyConfig::parse(url)?))),
            }
        };
        let tcp = parse_slot(tcp)?;
        let udp = parse_slot(udp)?;
        let mut slots = self.core.proxies.write().expect("proxy slots poisoned");
        if let Some(v) = tcp {
            slots.tcp = v;
        }
        if let Some(v) = udp {
            slots.udp = v;
        }
        Ok(())
    }

    // ---- 生命周期 ----

    /// 关闭全部池化连接，保留 jar / 票据 / 仲裁提示。
    /// 之后的请求走全新握手，可吃 0-RTT。
    /// `switch_protocol` 顺带改写强制协议槽，对后续 refresh 持续生效。
    pub async fn refresh(&self, switch_protocol: Option<Protocol>) {
        self.core.assert_open();
        if let Some(p) = switch_protocol {
            *self.core.forced.write().expect("forced slot poisoned") = Some(p);
        }
        self.core.pool.close_all().await;
        self.core.tickets.sweep_expired();
        debug!("session refreshed (tickets={} cookies={})", self.core.tickets.len(), self.core.jar.len());
    }

    /// 模拟页面加载，预热票据与 cookie；子资源错误吞掉
    pub async fn warmup(&self, url: &str) -> Result<()> {
        self.core.assert_open();
        crate::warmup::run(self, url).await
    }

    /// fork n 个兄弟会话：共享 jar 与票据缓存，独立池与仲裁提示
    pub fn fork(&self, n: usize) -> Vec<Session> {
        self.core.assert_open();
        let mut children = Vec::with_capacity(n);
        for _ in 0..n {
            let core = Arc::new(SessionCore {
                preset: self.core.preset.clone(),
                jar: self.core.jar.clone(),
                tickets: self.core.tickets.clone(),
                pool: Pool::new(PoolConfig::default()),
                arbiter: Arbiter::new(),
                options: self.core.options.clone(),
                proxies: RwLock::new(ProxySlots {
                    tcp: self.core.tcp_proxy(),
                    udp: self.core.udp_proxy(),
                }),
                forced: RwLock::new(self.core.forced_protocol()),
                keylog: RwLock::new(self.core.keylog.read().expect("keylog slot poisoned").clone()),
                session_seed: rand::thread_rng().gen(),
                closed: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            });
            self.core.children.lock().expect("children poisoned").push(core.clone());
            children.push(Session { core });
        }
        children
    }

    // ---- 持久化 ----

    pub fn snapshot(&self) -> SessionState {
        SessionState {
            version: STATE_VERSION,
            preset: self.core.preset.name.to_string(),
            forced_protocol: self.core.forced_protocol(),
            cookies: self.core.jar.all(),
            tickets: self.core.tickets.snapshot(),
            ech_configs: self.core.options.ech_overrides.clone(),
            hints: self.core.arbiter.snapshot(),
        }
    }

    /// 0600 权限落盘
    pub fn save(&self, path: &Path) -> Result<()> {
        self.core.assert_open();
        self.snapshot().save_to(path)
    }

    /// 从状态 blob 重建会话
    pub fn load(path: &Path) -> Result<Session> {
        let state = SessionState::load_from(path)?;
        Session::from_state(state)
    }

    pub fn from_state(state: SessionState) -> Result<Session> {
        let mut builder = SessionBuilder::new(&state.preset);
        if let Some(p) = state.forced_protocol {
            builder = builder.http_version(p);
        }
        for (domain, config) in &state.ech_configs {
            builder = builder.ech_config_override(domain, config);
        }
        let session = builder.build()?;
        session.core.jar.restore(state.cookies);
        session.core.tickets.restore(state.tickets);
        session.core.arbiter.restore(state.hints);
        Ok(session)
    }

    // ---- 其它 ----

    pub fn register_ticket_backend(
        &self,
        backend: Arc<dyn TicketBackend>,
        on_error: BackendErrorHook,
    ) {
        self.core.assert_open();
        self.core.tickets.register_backend(backend, on_error);
    }

    pub fn set_key_log_sink(&self, sink: Arc<KeyLogSink>) {
        *self.core.keylog.write().expect("keylog slot poisoned") = Some(sink);
    }

    pub fn pool_stats(&self) -> Vec<crate::transport::pool::PoolStats> {
        self.core.pool.stats()
    }

    /// 关闭会话及其 fork 出的子会话；等在途流归零或关闭截止到期
    pub async fn close(&self) {
        self.core.close().await;
    }

    /// 给取消令牌派生用
    pub fn new_cancel_token(&self, timeout: Option<Duration>) -> CancelToken {
        match timeout {
            Some(t) => CancelToken::with_timeout(t),
            None => CancelToken::new(),
        }
    }
}
