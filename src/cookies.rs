//! Cookie 管理
//!
//! 按 (domain, path, name) 键存储；请求匹配遵循 RFC 6265 的
//! domain-match / path-match / secure-only 规则。
//! Cookie 头的拼接顺序：路径长的在前，同长按创建时间先后。
//! jar 被 fork 出的兄弟会话共享（克隆即共享同一存储）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// SameSite 属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Cookie
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    /// Set-Cookie 未带 Domain 属性时为 true：仅精确 host 匹配
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    /// 绝对过期时间；None 为会话 cookie
    pub expires: Option<SystemTime>,
    pub created_at: SystemTime,
    pub last_access: SystemTime,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into().to_ascii_lowercase(),
            host_only: true,
            path: "/".to_string(),
            secure: false,
            http_only: false,
            same_site: None,
            expires: None,
            created_at: now,
            last_access: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expires, Some(at) if SystemTime::now() > at)
    }

    /// 从 Set-Cookie 头解析；`request_host` 用于补全缺省 domain
    pub fn parse_set_cookie(header: &str, request_host: &str) -> Option<Self> {
        let mut parts = header.split(';');

        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut cookie = Cookie::new(name, value.trim(), request_host);

        let mut max_age: Option<i64> = None;
        let mut expires: Option<SystemTime> = None;

        for attr in parts {
            let attr = attr.trim();
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
                None => (attr.to_ascii_lowercase(), ""),
            };
            match key.as_str() {
                "domain" => {
                    let d = val.trim_start_matches('.').to_ascii_lowercase();
                    if !d.is_empty() && domain_match(request_host, &d) {
                        cookie.domain = d;
                        cookie.host_only = false;
                    }
                }
                "path" => {
                    if val.starts_with('/') {
                        cookie.path = val.to_string();
                    }
                }
                "max-age" => {
                    if let Ok(secs) = val.parse::<i64>() {
                        max_age = Some(secs);
                    }
                }
                "expires" => {
                    if let Some(at) = parse_http_date(val) {
                        expires = Some(at);
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => {
                    cookie.same_site = match val.to_ascii_lowercase().as_str() {
                        "strict" => Some(SameSite::Strict),
                        "lax" => Some(SameSite::Lax),
                        "none" => Some(SameSite::None),
                        _ => None,
                    };
                }
                _ => {}
            }
        }

        // Max-Age 优先于 Expires
        cookie.expires = match max_age {
            Some(secs) if secs <= 0 => Some(SystemTime::UNIX_EPOCH),
            Some(secs) => Some(SystemTime::now() + std::time::Duration::from_secs(secs as u64)),
            None => expires,
        };

        Some(cookie)
    }
}

/// RFC 6265 5.1.3 domain-match
pub fn domain_match(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    host == domain || (host.ends_with(&domain) && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// RFC 6265 5.1.4 path-match
pub fn path_match(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes()[cookie_path.len()] == b'/'))
}

/// RFC 1123 / 旧式 HTTP 日期
fn parse_http_date(s: &str) -> Option<SystemTime> {
    for fmt in ["%a, %d %b %Y %H:%M:%S GMT", "%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            let dt: DateTime<Utc> = DateTime::from_naive_utc_and_offset(dt, Utc);
            return Some(dt.into());
        }
    }
    None
}

type JarKey = (String, String, String); // (domain, path, name)

/// Cookie 存储（克隆即共享）
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    inner: Arc<RwLock<HashMap<JarKey, Cookie>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入或覆盖同键 cookie；覆盖保留原创建时间
    pub fn set(&self, cookie: Cookie) {
        let key = (cookie.domain.clone(), cookie.path.clone(), cookie.name.clone());
        let mut map = self.inner.write().expect("cookie jar poisoned");
        match map.get_mut(&key) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = cookie;
                existing.created_at = created_at;
            }
            None => {
                map.insert(key, cookie);
            }
        }
    }

    /// 解析一条 Set-Cookie 并入库
    pub fn store_from_response(&self, set_cookie: &str, request_host: &str) {
        if let Some(cookie) = Cookie::parse_set_cookie(set_cookie, request_host) {
            if cookie.expires == Some(SystemTime::UNIX_EPOCH) {
                // 立即过期 = 删除
                let key = (cookie.domain.clone(), cookie.path.clone(), cookie.name.clone());
                self.inner.write().expect("cookie jar poisoned").remove(&key);
            } else {
                self.set(cookie);
            }
        }
    }

    /// 取请求可携带的 cookie，按发送顺序排好
    pub fn matching(&self, host: &str, path: &str, secure: bool) -> Vec<Cookie> {
        let map = self.inner.read().expect("cookie jar poisoned");
        let mut hits: Vec<Cookie> = map
            .values()
            .filter(|c| !c.is_expired())
            .filter(|c| {
                if c.host_only {
                    host.eq_ignore_ascii_case(&c.domain)
                } else {
                    domain_match(host, &c.domain)
                }
            })
            .filter(|c| path_match(path, &c.path))
            .filter(|c| secure || !c.secure)
            .cloned()
            .collect();
        hits.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.created_at.cmp(&b.created_at))
        });
        hits
    }

    /// 拼 Cookie 头；无可携带 cookie 时为 None
    pub fn header_for(&self, host: &str, path: &str, secure: bool) -> Option<String> {
        let hits = self.matching(host, path, secure);
        if hits.is_empty() {
            return None;
        }
        Some(
            hits.iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// 所有未过期 cookie 的快照
    pub fn all(&self) -> Vec<Cookie> {
        self.inner
            .read()
            .expect("cookie jar poisoned")
            .values()
            .filter(|c| !c.is_expired())
            .cloned()
            .collect()
    }

    /// 从快照整体恢复（load 路径）
    pub fn restore(&self, cookies: Vec<Cookie>) {
        let mut map = self.inner.write().expect("cookie jar poisoned");
        map.clear();
        for c in cookies {
            map.insert((c.domain.clone(), c.path.clone(), c.name.clone()), c);
        }
    }

    pub fn clear(&self) {
        self.inner.write().expect("cookie jar poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cookie jar poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_cookie_attributes() {
        let c =
            Cookie::parse_set_cookie("sid=abc123; Path=/app; Secure; HttpOnly; SameSite=Lax", "x.test")
                .unwrap();
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.path, "/app");
        assert!(c.secure);
        assert!(c.http_only);
        assert_eq!(c.same_site, Some(SameSite::Lax));
        assert!(c.host_only);
    }

    #[test]
    fn test_domain_attribute_widens_scope() {
        let c = Cookie::parse_set_cookie("a=1; Domain=.example.test", "sub.example.test").unwrap();
        assert_eq!(c.domain, "example.test");
        assert!(!c.host_only);
    }

    #[test]
    fn test_foreign_domain_attribute_rejected() {
        let c = Cookie::parse_set_cookie("a=1; Domain=evil.test", "example.test").unwrap();
        // 非法 Domain 被忽略，退回 host-only
        assert_eq!(c.domain, "example.test");
        assert!(c.host_only);
    }

    #[test]
    fn test_domain_match() {
        assert!(domain_match("sub.example.test", "example.test"));
        assert!(domain_match("example.test", "example.test"));
        assert!(!domain_match("notexample.test", "example.test"));
    }

    #[test]
    fn test_path_match() {
        assert!(path_match("/app/page", "/app"));
        assert!(path_match("/app", "/app"));
        assert!(path_match("/app/", "/app/"));
        assert!(!path_match("/application", "/app"));
    }

    #[test]
    fn test_emit_order_path_length_then_creation() {
        let jar = CookieJar::new();
        let mut a = Cookie::new("a", "1", "x.test");
        a.path = "/".into();
        jar.set(a);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut b = Cookie::new("b", "2", "x.test");
        b.path = "/deep/path".into();
        jar.set(b);

        let header = jar.header_for("x.test", "/deep/path/page", true).unwrap();
        assert_eq!(header, "b=2; a=1");
    }

    #[test]
    fn test_secure_only_on_https() {
        let jar = CookieJar::new();
        let mut c = Cookie::new("s", "1", "x.test");
        c.secure = true;
        jar.set(c);
        assert!(jar.header_for("x.test", "/", false).is_none());
        assert_eq!(jar.header_for("x.test", "/", true).unwrap(), "s=1");
    }

    #[test]
    fn test_overwrite_keeps_creation_time() {
        let jar = CookieJar::new();
        jar.set(Cookie::new("k", "old", "x.test"));
        let created = jar.all()[0].created_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        jar.set(Cookie::new("k", "new", "x.test"));
        let snapshot = jar.all();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].value, "new");
        assert_eq!(snapshot[0].created_at, created);
    }

    #[test]
    fn test_max_age_zero_deletes() {
        let jar = CookieJar::new();
        jar.set(Cookie::new("k", "v", "x.test"));
        jar.store_from_response("k=; Max-Age=0", "x.test");
        assert!(jar.header_for("x.test", "/", true).is_none());
    }

    #[test]
    fn test_clone_shares_storage() {
        let jar = CookieJar::new();
        let sibling = jar.clone();
        sibling.set(Cookie::new("shared", "1", "x.test"));
        assert_eq!(jar.header_for("x.test", "/", true).unwrap(), "shared=1");
    }

    #[test]
    fn test_parse_expires_http_date() {
        let c = Cookie::parse_set_cookie("k=v; Expires=Wed, 21 Oct 2015 07:28:00 GMT", "x.test")
            .unwrap();
        assert!(c.is_expired());
    }
}
