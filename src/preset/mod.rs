//! 指纹 preset 注册表
//!
//! preset 是一份不可变的浏览器全链路网络身份：TLS ClientHello 配置、
//! HTTP/2 连接前导、HTTP/3 传输参数、请求头模板与平台信息。
//! 注册表进程内只初始化一次，`<family>-latest` 别名在构建注册表时
//! 解析到具体版本。

pub mod catalog;
pub mod grease;
pub mod h2_spec;
pub mod h3_spec;
pub mod template;
pub mod tls_spec;

pub use grease::{is_grease_value, GreaseDraw, TLS_GREASE_VALUES};
pub use h2_spec::{H2Setting, H2Spec, PriorityFrame, PriorityParam, PseudoHeader};
pub use h3_spec::{H3Settings, H3Spec, QuicTransportParams};
pub use template::{HeaderSlot, HeaderTemplate, PlatformInfo, SlotValue};
pub use tls_spec::{ExtensionSpec, KeyShareOffer, TlsSpec, TlsVersion};

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// 浏览器家族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserFamily {
    Chrome,
    Firefox,
    Safari,
}

/// 协议支持标志
#[derive(Debug, Clone, Copy)]
pub struct ProtocolSupport {
    pub h1: bool,
    pub h2: bool,
    pub h3: bool,
}

/// 浏览器指纹 preset（注册后不可变，按名字判等）
#[derive(Debug, Clone)]
pub struct Preset {
    pub name: &'static str,
    pub family: BrowserFamily,
    pub tls: TlsSpec,
    pub h2: H2Spec,
    /// 不支持 H3 的 preset 为 None
    pub h3: Option<H3Spec>,
    pub headers: HeaderTemplate,
    pub platform: PlatformInfo,
    pub supports: ProtocolSupport,
}

impl PartialEq for Preset {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Preset {}

impl std::hash::Hash for Preset {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// 全局 preset 注册表（线程安全，首次访问时构建）
static REGISTRY: OnceLock<HashMap<&'static str, Arc<Preset>>> = OnceLock::new();

fn registry() -> &'static HashMap<&'static str, Arc<Preset>> {
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        for preset in catalog::build_all() {
            preset
                .headers
                .validate()
                .unwrap_or_else(|e| panic!("preset {} 模板非法: {e}", preset.name));
            let arc = Arc::new(preset);
            map.insert(arc.name, arc);
        }
        // 别名在构建时解析到具体版本
        for (alias, target) in catalog::ALIASES {
            let resolved = map
                .get(target)
                .unwrap_or_else(|| panic!("alias {alias} 指向未注册的 preset {target}"))
                .clone();
            map.insert(alias, resolved);
        }
        map
    })
}

/// 按名字查找 preset，O(1)
pub fn lookup(name: &str) -> Result<Arc<Preset>> {
    registry()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Configuration(format!("unknown preset: {name}")))
}

/// 已注册的 preset 名称列表（含别名）
pub fn available() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = registry().keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known() {
        let p = lookup("chrome-143").unwrap();
        assert_eq!(p.name, "chrome-143");
        assert_eq!(p.family, BrowserFamily::Chrome);
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(matches!(lookup("netscape-4"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_aliases_resolve_to_dated() {
        let latest = lookup("chrome-latest").unwrap();
        assert_eq!(latest.name, "chrome-143");
        let ff = lookup("firefox-latest").unwrap();
        assert_eq!(ff.name, "firefox-133");
        let sf = lookup("safari-latest").unwrap();
        assert_eq!(sf.name, "safari-18");
    }

    #[test]
    fn test_equality_by_name() {
        let a = lookup("chrome-143").unwrap();
        let b = lookup("chrome-latest").unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_all_presets_registered() {
        for name in [
            "chrome-143",
            "chrome-143-windows",
            "chrome-143-macos",
            "chrome-143-linux",
            "chrome-131",
            "firefox-133",
            "safari-18",
            "chrome-mobile-ios",
            "chrome-mobile-android",
            "safari-mobile-ios",
        ] {
            assert!(lookup(name).is_ok(), "missing preset {name}");
        }
    }
}
