//! 页面预热
//!
//! 模拟一次人类页面加载：以导航上下文取根文档，从响应里
//! 保守地发现少量子资源（脚本/样式/图片各有配额），再以
//! 对应上下文、正确 referrer 与真实的请求间隔发起子请求。
//! 目的只是预热票据与 cookie，子资源错误一律吞掉。

use crate::headers::RequestContext;
use crate::request::{Method, ParsedUrl, Request};
use crate::session::Session;
use log::debug;
use rand::Rng;
use std::time::Duration;

/// 子资源配额
const MAX_SCRIPTS: usize = 3;
const MAX_STYLES: usize = 3;
const MAX_IMAGES: usize = 4;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SubresourceKind {
    Script,
    Style,
    Image,
}

pub(crate) struct Subresource {
    pub kind: SubresourceKind,
    pub url: String,
}

/// 入口：根文档 + 子资源
pub(crate) async fn run(session: &Session, url: &str) -> crate::error::Result<()> {
    let page = ParsedUrl::parse(url)?;
    let request = Request::new(Method::Get, url).with_context(RequestContext::navigation());
    let response = session.request(request).await?;
    let page_url = response.final_url.clone();
    let body = response.bytes().await?;

    let subresources = discover(&body, &ParsedUrl::parse(&page_url).unwrap_or(page));
    debug!("warmup {page_url}: {} subresources", subresources.len());

    for sub in subresources {
        // 真实浏览器的子请求不会零间隔齐射
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(40..220));
        tokio::time::sleep(jitter).await;

        let context = match sub.kind {
            SubresourceKind::Script => RequestContext::script(&page_url),
            SubresourceKind::Style => RequestContext::style(&page_url),
            SubresourceKind::Image => RequestContext::image(&page_url),
        };
        let request = Request::new(Method::Get, &sub.url).with_context(context);
        match session.request(request).await {
            Ok(response) => {
                // 排干体，让连接回池、票据落库
                let _ = response.bytes().await;
            }
            Err(e) => debug!("warmup subresource {} failed: {e}", sub.url),
        }
    }
    Ok(())
}

/// 从 HTML 字节里保守发现子资源：只认 `<script src=`、
/// `<link rel="stylesheet" href=`、`<img src=`，不做完整解析
pub(crate) fn discover(body: &[u8], page: &ParsedUrl) -> Vec<Subresource> {
    let text = String::from_utf8_lossy(body);
    let mut out = Vec::new();
    let mut scripts = 0;
    let mut styles = 0;
    let mut images = 0;

    let mut rest = text.as_ref();
    while let Some(lt) = rest.find('<') {
        rest = &rest[lt..];
        let end = match rest.find('>') {
            Some(e) => e,
            None => break,
        };
        let tag = &rest[..end];
        let lower = tag.to_ascii_lowercase();

        if lower.starts_with("<script") && scripts < MAX_SCRIPTS {
            if let Some(url) = attr_value(tag, &lower, "src").and_then(|v| absolutize(page, v)) {
                scripts += 1;
                out.push(Subresource { kind: SubresourceKind::Script, url });
            }
        } else if lower.starts_with("<link")
            && lower.contains("stylesheet")
            && styles < MAX_STYLES
        {
            if let Some(url) = attr_value(tag, &lower, "href").and_then(|v| absolutize(page, v)) {
                styles += 1;
                out.push(Subresource { kind: SubresourceKind::Style, url });
            }
        } else if lower.starts_with("<img") && images < MAX_IMAGES {
            if let Some(url) = attr_value(tag, &lower, "src").and_then(|v| absolutize(page, v)) {
                images += 1;
                out.push(Subresource { kind: SubresourceKind::Image, url });
            }
        }

        rest = &rest[end..];
    }
    out
}

/// 在单个标签文本里取属性值（大小写不敏感，引号可选）
fn attr_value<'a>(tag: &'a str, lower: &str, name: &str) -> Option<&'a str> {
    let pat = format!("{name}=");
    let at = lower.find(&pat)? + pat.len();
    let rest = &tag[at..];
    let (quote, rest) = match rest.chars().next()? {
        q @ ('"' | '\'') => (Some(q), &rest[1..]),
        _ => (None, rest),
    };
    let end = match quote {
        Some(q) => rest.find(q)?,
        None => rest.find([' ', '>', '/']).unwrap_or(rest.len()),
    };
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// 相对引用解析到页面 origin；data:/javascript: 丢弃
fn absolutize(page: &ParsedUrl, value: &str) -> Option<String> {
    if value.starts_with("data:") || value.starts_with("javascript:") {
        return None;
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    page.join_location(value).ok().map(|u| u.to_url_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> ParsedUrl {
        ParsedUrl::parse("https://example.test/dir/index.html").unwrap()
    }

    #[test]
    fn test_discover_respects_budget() {
        let mut html = String::from("<html>");
        for i in 0..10 {
            html.push_str(&format!("<script src=\"/s{i}.js\"></script>"));
        }
        for i in 0..10 {
            html.push_str(&format!("<img src=\"/i{i}.png\">"));
        }
        let found = discover(html.as_bytes(), &page());
        let scripts = found.iter().filter(|s| s.kind == SubresourceKind::Script).count();
        let images = found.iter().filter(|s| s.kind == SubresourceKind::Image).count();
        assert_eq!(scripts, MAX_SCRIPTS);
        assert_eq!(images, MAX_IMAGES);
    }

    #[test]
    fn test_discover_stylesheet_only_link() {
        let html = r#"
            <link rel="preconnect" href="https://cdn.test">
            <link rel="stylesheet" href="/main.css">
        "#;
        let found = discover(html.as_bytes(), &page());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, SubresourceKind::Style);
        assert_eq!(found[0].url, "https://example.test/main.css");
    }

    #[test]
    fn test_discover_resolves_relative() {
        let html = r#"<img src="pic.png">"#;
        let found = discover(html.as_bytes(), &page());
        assert_eq!(found[0].url, "https://example.test/dir/pic.png");
    }

    #[test]
    fn test_discover_skips_data_uris() {
        let html = r#"<img src="data:image/png;base64,AAAA">"#;
        assert!(discover(html.as_bytes(), &page()).is_empty());
    }

    #[test]
    fn test_attr_value_unquoted() {
        let tag = "<img src=/x.png width=5";
        let lower = tag.to_ascii_lowercase();
        assert_eq!(attr_value(tag, &lower, "src"), Some("/x.png"));
    }
}
