//! 请求头装配
//!
//! 按 preset 模板的顺序产出最终请求头：调用方显式头命中槽位时
//! 覆盖默认值但保留位置，未命中的槽位按请求上下文填充，
//! 模板之外的头插在 Extras 槽。`Sec-Fetch-*` 与 client hints
//! 的取值必须与 mode/dest/site 互相一致，否则整套头在
//! 反爬侧一眼就是假的。

use crate::error::Protocol;
use crate::preset::{Preset, SlotValue};

/// fetch mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Navigate,
    Cors,
    NoCors,
    SameOrigin,
    Websocket,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Navigate => "navigate",
            FetchMode::Cors => "cors",
            FetchMode::NoCors => "no-cors",
            FetchMode::SameOrigin => "same-origin",
            FetchMode::Websocket => "websocket",
        }
    }
}

/// fetch destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDest {
    Document,
    Image,
    Script,
    Style,
    Font,
    Xhr,
    Empty,
}

impl FetchDest {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchDest::Document => "document",
            FetchDest::Image => "image",
            FetchDest::Script => "script",
            FetchDest::Style => "style",
            FetchDest::Font => "font",
            // fetch()/XHR 的 dest 都是空串
            FetchDest::Xhr | FetchDest::Empty => "empty",
        }
    }
}

/// fetch site（由 referrer 与目标 origin 推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSite {
    None,
    SameOrigin,
    SameSite,
    CrossSite,
}

impl FetchSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchSite::None => "none",
            FetchSite::SameOrigin => "same-origin",
            FetchSite::SameSite => "same-site",
            FetchSite::CrossSite => "cross-site",
        }
    }
}

/// 请求上下文：决定 Accept、Sec-Fetch-* 等上下文相关头的取值
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub mode: FetchMode,
    pub dest: FetchDest,
    pub user_triggered: bool,
    /// 完整 referrer URL；地址栏直达为 None
    pub referrer: Option<String>,
}

impl RequestContext {
    /// 地址栏导航（用户触发）
    pub fn navigation() -> Self {
        Self {
            mode: FetchMode::Navigate,
            dest: FetchDest::Document,
            user_triggered: true,
            referrer: None,
        }
    }

    /// 页面内脚本子资源
    pub fn script(referrer: &str) -> Self {
        Self {
            mode: FetchMode::NoCors,
            dest: FetchDest::Script,
            user_triggered: false,
            referrer: Some(referrer.to_string()),
        }
    }

    /// 样式表子资源
    pub fn style(referrer: &str) -> Self {
        Self {
            mode: FetchMode::NoCors,
            dest: FetchDest::Style,
            user_triggered: false,
            referrer: Some(referrer.to_string()),
        }
    }

    /// 图片子资源
    pub fn image(referrer: &str) -> Self {
        Self {
            mode: FetchMode::NoCors,
            dest: FetchDest::Image,
            user_triggered: false,
            referrer: Some(referrer.to_string()),
        }
    }

    /// fetch()/XHR 请求
    pub fn xhr(referrer: &str) -> Self {
        Self {
            mode: FetchMode::Cors,
            dest: FetchDest::Xhr,
            user_triggered: false,
            referrer: Some(referrer.to_string()),
        }
    }

    /// 由 referrer 与目标 host 计算 Sec-Fetch-Site
    pub fn site_for(&self, target_host: &str) -> FetchSite {
        let referrer = match &self.referrer {
            Some(r) => r,
            None => return FetchSite::None,
        };
        let ref_host = match host_of(referrer) {
            Some(h) => h,
            None => return FetchSite::None,
        };
        if ref_host.eq_ignore_ascii_case(target_host) {
            FetchSite::SameOrigin
        } else if registrable_domain(&ref_host) == registrable_domain(target_host) {
            FetchSite::SameSite
        } else {
            FetchSite::CrossSite
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let host_port = &rest[..end];
    let host = host_port.rsplit_once(':').map(|(h, _)| h).unwrap_or(host_port);
    Some(host.to_ascii_lowercase())
}

/// 可注册域近似：取末尾两个 label。不引入 PSL 表，
/// 对 co.uk 之类的多级后缀会把 same-site 误判为 cross-site 的
/// 反方向（更保守），指纹一致性不受影响。
fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.rsplitn(3, '.').collect();
    if labels.len() >= 2 {
        format!("{}.{}", labels[1], labels[0])
    } else {
        host.to_string()
    }
}

/// (family, mode, dest) → Accept 值
fn accept_value(preset: &Preset, ctx: &RequestContext) -> &'static str {
    use crate::preset::BrowserFamily::*;
    match (ctx.dest, preset.family) {
        (FetchDest::Document, Chrome) => {
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7"
        }
        (FetchDest::Document, Firefox) => {
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/png,image/svg+xml,*/*;q=0.8"
        }
        (FetchDest::Document, Safari) => {
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
        }
        (FetchDest::Image, Chrome) => {
            "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8"
        }
        (FetchDest::Image, Firefox) => {
            "image/avif,image/webp,image/png,image/svg+xml,image/*;q=0.8,*/*;q=0.5"
        }
        (FetchDest::Image, Safari) => {
            "image/webp,image/avif,image/png,image/svg+xml,image/*;q=0.8,*/*;q=0.5"
        }
        (FetchDest::Style, _) => "text/css,*/*;q=0.1",
        (FetchDest::Script, _) | (FetchDest::Font, _) => "*/*",
        (FetchDest::Xhr, _) | (FetchDest::Empty, _) => "*/*",
    }
}

/// 头装配入口
///
/// `explicit` 是调用方显式头（保持插入顺序）；`cookie_header`
/// 已由 jar 按路径长度降序、创建时间升序拼好。
#[allow(clippy::too_many_arguments)]
pub fn assemble(
    preset: &Preset,
    ctx: &RequestContext,
    target_host: &str,
    https: bool,
    explicit: &[(String, String)],
    cookie_header: Option<&str>,
    tls_only: bool,
    proto: Protocol,
) -> Vec<(String, String)> {
    if tls_only {
        return assemble_tls_only(target_host, explicit, proto);
    }

    let mut out: Vec<(String, String)> = Vec::with_capacity(explicit.len() + 16);
    let mut consumed = vec![false; explicit.len()];

    let find_explicit = |name: &str, consumed: &mut [bool]| -> Option<String> {
        for (i, (k, v)) in explicit.iter().enumerate() {
            if !consumed[i] && k.eq_ignore_ascii_case(name) {
                consumed[i] = true;
                return Some(v.clone());
            }
        }
        None
    };

    let site = ctx.site_for(target_host);

    for slot in &preset.headers.slots {
        // 槽位命中的显式头覆盖默认值但保留位置
        if !slot.name.is_empty() {
            if let Some(v) = find_explicit(slot.name, &mut consumed) {
                let host_on_h2 =
                    matches!(slot.value, SlotValue::Host) && proto != Protocol::Http1;
                if !host_on_h2 && header_allowed(slot.name, proto) {
                    out.push((slot.name.to_string(), v));
                }
                continue;
            }
        }

        let value: Option<String> = match slot.value {
            SlotValue::Static(v) => Some(v.to_string()),
            SlotValue::Host => {
                // h2/h3 用 :authority 伪头
                if proto == Protocol::Http1 {
                    Some(target_host.to_string())
                } else {
                    None
                }
            }
            SlotValue::UserAgent => Some(preset.headers.user_agent.to_string()),
            SlotValue::Accept => Some(accept_value(preset, ctx).to_string()),
            SlotValue::AcceptLanguage => Some(preset.headers.accept_language.to_string()),
            SlotValue::AcceptEncoding => Some(preset.headers.accept_encoding.to_string()),
            SlotValue::SecChUa => {
                if preset.headers.sec_ch_ua.is_empty() {
                    None
                } else {
                    Some(preset.headers.sec_ch_ua.to_string())
                }
            }
            SlotValue::SecChUaMobile => {
                if preset.headers.sec_ch_ua.is_empty() {
                    None
                } else {
                    Some(preset.platform.sec_ch_ua_mobile().to_string())
                }
            }
            SlotValue::SecChUaPlatform => {
                if preset.headers.sec_ch_ua.is_empty() {
                    None
                } else {
                    Some(preset.platform.sec_ch_ua_platform())
                }
            }
            SlotValue::UpgradeInsecureRequests => {
                (ctx.mode == FetchMode::Navigate).then(|| "1".to_string())
            }
            SlotValue::SecFetchSite => (preset.headers.emit_sec_fetch && https)
                .then(|| site.as_str().to_string()),
            SlotValue::SecFetchMode => (preset.headers.emit_sec_fetch && https)
                .then(|| ctx.mode.as_str().to_string()),
            SlotValue::SecFetchUser => (preset.headers.emit_sec_fetch
                && https
                && ctx.mode == FetchMode::Navigate
                && ctx.user_triggered)
                .then(|| "?1".to_string()),
            SlotValue::SecFetchDest => (preset.headers.emit_sec_fetch && https)
                .then(|| ctx.dest.as_str().to_string()),
            SlotValue::Referer => ctx.referrer.clone(),
            SlotValue::Extras => {
                for (i, (k, v)) in explicit.iter().enumerate() {
                    if !consumed[i] && !preset.headers.declares(k) {
                        consumed[i] = true;
                        if header_allowed(k, proto) {
                            out.push((k.clone(), v.clone()));
                        }
                    }
                }
                None
            }
            SlotValue::Cookie => cookie_header.map(|c| c.to_string()),
        };

        if let Some(v) = value {
            if header_allowed(slot.name, proto) {
                out.push((slot.name.to_string(), v));
            }
        }
    }

    // 命中过已声明槽位名之外的剩余显式头（模板缺 Extras 时兜底追加）
    for (i, (k, v)) in explicit.iter().enumerate() {
        if !consumed[i] && header_allowed(k, proto) {
            out.push((k.clone(), v.clone()));
        }
    }

    out
}

fn assemble_tls_only(
    target_host: &str,
    explicit: &[(String, String)],
    proto: Protocol,
) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(explicit.len() + 1);
    let has_host = explicit.iter().any(|(k, _)| k.eq_ignore_ascii_case("host"));
    if proto == Protocol::Http1 && !has_host {
        out.push(("Host".to_string(), target_host.to_string()));
    }
    for (k, v) in explicit {
        if proto != Protocol::Http1 && k.eq_ignore_ascii_case("host") {
            continue;
        }
        if header_allowed(k, proto) {
            out.push((k.clone(), v.clone()));
        }
    }
    out
}

/// 逐跳头在 h2/h3 上非法；te 仅 h2 且值为 trailers 时合法
fn header_allowed(name: &str, proto: Protocol) -> bool {
    if proto == Protocol::Http1 {
        return true;
    }
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade" => false,
        "te" => proto == Protocol::Http2,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::lookup;

    fn names(headers: &[(String, String)]) -> Vec<String> {
        headers.iter().map(|(k, _)| k.to_ascii_lowercase()).collect()
    }

    fn get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_navigation_headers_chrome() {
        let p = lookup("chrome-143").unwrap();
        let ctx = RequestContext::navigation();
        let h = assemble(&p, &ctx, "example.test", true, &[], None, false, Protocol::Http2);

        assert_eq!(get(&h, "sec-fetch-mode"), Some("navigate"));
        assert_eq!(get(&h, "sec-fetch-site"), Some("none"));
        assert_eq!(get(&h, "sec-fetch-user"), Some("?1"));
        assert_eq!(get(&h, "sec-fetch-dest"), Some("document"));
        assert_eq!(get(&h, "upgrade-insecure-requests"), Some("1"));
        assert!(get(&h, "accept").unwrap().starts_with("text/html"));
        // h2 不发 Host 与 Connection
        assert!(get(&h, "host").is_none());
        assert!(get(&h, "connection").is_none());
    }

    #[test]
    fn test_subresource_no_upgrade_insecure() {
        let p = lookup("chrome-143").unwrap();
        let ctx = RequestContext::image("https://example.test/");
        let h = assemble(&p, &ctx, "example.test", true, &[], None, false, Protocol::Http2);
        assert!(get(&h, "upgrade-insecure-requests").is_none());
        assert_eq!(get(&h, "sec-fetch-site"), Some("same-origin"));
        assert_eq!(get(&h, "sec-fetch-dest"), Some("image"));
        assert!(get(&h, "sec-fetch-user").is_none());
        assert!(get(&h, "accept").unwrap().starts_with("image/"));
        assert_eq!(get(&h, "referer"), Some("https://example.test/"));
    }

    #[test]
    fn test_explicit_header_keeps_slot_position() {
        let p = lookup("chrome-143").unwrap();
        let ctx = RequestContext::navigation();
        let explicit = vec![("accept".to_string(), "application/json".to_string())];
        let h = assemble(&p, &ctx, "example.test", true, &explicit, None, false, Protocol::Http2);
        assert_eq!(get(&h, "accept"), Some("application/json"));
        // Accept 仍在 Sec-Fetch-Site 之前（模板位置）
        let ns = names(&h);
        let accept_at = ns.iter().position(|n| n == "accept").unwrap();
        let site_at = ns.iter().position(|n| n == "sec-fetch-site").unwrap();
        assert!(accept_at < site_at);
    }

    #[test]
    fn test_extras_before_cookie() {
        let p = lookup("chrome-143").unwrap();
        let ctx = RequestContext::navigation();
        let explicit = vec![("X-Api-Key".to_string(), "k".to_string())];
        let h = assemble(
            &p,
            &ctx,
            "example.test",
            true,
            &explicit,
            Some("sid=abc"),
            false,
            Protocol::Http2,
        );
        let ns = names(&h);
        let extra_at = ns.iter().position(|n| n == "x-api-key").unwrap();
        let cookie_at = ns.iter().position(|n| n == "cookie").unwrap();
        assert!(extra_at < cookie_at);
        assert_eq!(get(&h, "cookie"), Some("sid=abc"));
    }

    #[test]
    fn test_safari_omits_sec_fetch() {
        let p = lookup("safari-18").unwrap();
        let ctx = RequestContext::navigation();
        let h = assemble(&p, &ctx, "example.test", true, &[], None, false, Protocol::Http2);
        assert!(get(&h, "sec-fetch-mode").is_none());
        assert!(get(&h, "sec-ch-ua").is_none());
    }

    #[test]
    fn test_plain_http_no_sec_fetch() {
        let p = lookup("chrome-143").unwrap();
        let ctx = RequestContext::navigation();
        let h = assemble(&p, &ctx, "example.test", false, &[], None, false, Protocol::Http1);
        assert!(get(&h, "sec-fetch-mode").is_none());
        assert_eq!(get(&h, "host"), Some("example.test"));
    }

    #[test]
    fn test_tls_only_mode() {
        let p = lookup("chrome-143").unwrap();
        let ctx = RequestContext::navigation();
        let explicit = vec![
            ("User-Agent".to_string(), "upstream/1.0".to_string()),
            ("X-Thing".to_string(), "1".to_string()),
        ];
        let h = assemble(&p, &ctx, "example.test", true, &explicit, None, true, Protocol::Http1);
        assert_eq!(h.len(), 3); // Host + 两个显式头
        assert_eq!(get(&h, "host"), Some("example.test"));
        assert_eq!(get(&h, "user-agent"), Some("upstream/1.0"));
        assert!(get(&h, "accept").is_none());
    }

    #[test]
    fn test_site_computation() {
        let ctx = RequestContext::image("https://a.example.test/page");
        assert_eq!(ctx.site_for("a.example.test"), FetchSite::SameOrigin);
        assert_eq!(ctx.site_for("b.example.test"), FetchSite::SameSite);
        assert_eq!(ctx.site_for("other.test"), FetchSite::CrossSite);
        assert_eq!(RequestContext::navigation().site_for("x.test"), FetchSite::None);
    }

    #[test]
    fn test_firefox_te_trailers_h2_only() {
        let p = lookup("firefox-133").unwrap();
        let ctx = RequestContext::navigation();
        let h2 = assemble(&p, &ctx, "example.test", true, &[], None, false, Protocol::Http2);
        assert_eq!(get(&h2, "te"), Some("trailers"));
        let h3 = assemble(&p, &ctx, "example.test", true, &[], None, false, Protocol::Http3);
        assert!(get(&h3, "te").is_none());
    }
}
