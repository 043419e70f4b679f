//! 请求头模板与平台信息
//!
//! 模板声明头的*顺序*与默认值；槽位值由请求上下文在发送时填充。
//! 调用方显式传入的同名头覆盖默认值但保留槽位位置；
//! 模板之外的头插入在 `Extras` 槽（通常在 Cookie 之前）。

/// 平台信息，用于填充 client hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Sec-Ch-Ua-Platform 的取值（不含引号）
    pub os: &'static str,
    /// 高熵 platform-version
    pub os_version: &'static str,
    /// 高熵 arch
    pub arch: &'static str,
    pub bitness: &'static str,
    /// 移动端设备型号；桌面为空
    pub model: &'static str,
    pub mobile: bool,
}

impl PlatformInfo {
    pub fn sec_ch_ua_mobile(&self) -> &'static str {
        if self.mobile {
            "?1"
        } else {
            "?0"
        }
    }

    pub fn sec_ch_ua_platform(&self) -> String {
        format!("\"{}\"", self.os)
    }
}

/// 槽位取值来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotValue {
    /// 固定字符串
    Static(&'static str),
    /// 请求目标的 host[:port]
    Host,
    UserAgent,
    /// 从 (mode, dest) 表取 Accept
    Accept,
    AcceptLanguage,
    AcceptEncoding,
    SecChUa,
    SecChUaMobile,
    SecChUaPlatform,
    /// 仅 navigate 模式出现
    UpgradeInsecureRequests,
    SecFetchSite,
    SecFetchMode,
    SecFetchUser,
    SecFetchDest,
    Referer,
    /// 模板外调用方头的插入点
    Extras,
    Cookie,
}

/// 一个模板槽位：规范大小写的名字 + 取值来源
#[derive(Debug, Clone, Copy)]
pub struct HeaderSlot {
    pub name: &'static str,
    pub value: SlotValue,
}

/// 请求头模板
#[derive(Debug, Clone)]
pub struct HeaderTemplate {
    pub user_agent: &'static str,
    /// Sec-Ch-Ua 的品牌列表字符串；Firefox/Safari 为空
    pub sec_ch_ua: &'static str,
    pub accept_language: &'static str,
    pub accept_encoding: &'static str,
    /// 槽位顺序（必须包含 Extras 与 Cookie）
    pub slots: Vec<HeaderSlot>,
    /// Safari 模板不发 Sec-Fetch-*
    pub emit_sec_fetch: bool,
}

impl HeaderTemplate {
    /// 校验模板形状（注册时调用一次）
    pub fn validate(&self) -> Result<(), String> {
        let has_extras = self.slots.iter().any(|s| matches!(s.value, SlotValue::Extras));
        let has_cookie = self.slots.iter().any(|s| matches!(s.value, SlotValue::Cookie));
        if !has_extras {
            return Err("header template missing extras slot".into());
        }
        if !has_cookie {
            return Err("header template missing cookie slot".into());
        }
        Ok(())
    }

    /// 模板里声明的头名（小写），用于判断调用方头是否命中槽位
    pub fn declares(&self, lower_name: &str) -> bool {
        self.slots.iter().any(|s| s.name.eq_ignore_ascii_case(lower_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_validate() {
        let t = HeaderTemplate {
            user_agent: "UA",
            sec_ch_ua: "",
            accept_language: "en-US,en;q=0.9",
            accept_encoding: "gzip, deflate, br",
            slots: vec![
                HeaderSlot { name: "User-Agent", value: SlotValue::UserAgent },
                HeaderSlot { name: "", value: SlotValue::Extras },
                HeaderSlot { name: "Cookie", value: SlotValue::Cookie },
            ],
            emit_sec_fetch: true,
        };
        assert!(t.validate().is_ok());
        assert!(t.declares("user-agent"));
        assert!(!t.declares("x-custom"));
    }

    #[test]
    fn test_platform_hints() {
        let p = PlatformInfo {
            os: "Linux",
            os_version: "6.8.0",
            arch: "x86",
            bitness: "64",
            model: "",
            mobile: false,
        };
        assert_eq!(p.sec_ch_ua_mobile(), "?0");
        assert_eq!(p.sec_ch_ua_platform(), "\"Linux\"");
    }
}
