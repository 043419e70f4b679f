//! 会话状态持久化
//!
//! 自描述、带版本号的 JSON blob：preset 名、强制协议、cookie、
//! 票据记录（按 origin）、ECH 配置缓存（domain → base64）、仲裁提示。
//! 低于当前版本或未知版本拒绝加载；更高版本尽力解析，
//! 未知字段忽略。落盘权限 0600。

use crate::cookies::Cookie;
use crate::error::{Error, Protocol, Result};
use crate::tickets::TicketRecord;
use crate::transport::arbiter::OriginHint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// 当前格式版本
pub const STATE_VERSION: u32 = 1;

/// 会话状态 blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub preset: String,
    #[serde(default)]
    pub forced_protocol: Option<Protocol>,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub tickets: Vec<TicketRecord>,
    /// domain → base64 ECH 配置
    #[serde(default)]
    pub ech_configs: HashMap<String, String>,
    #[serde(default)]
    pub hints: HashMap<String, OriginHint>,
}

impl SessionState {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("会话状态序列化失败: {e}")))
    }

    /// 解析并做版本门禁
    pub fn from_json(json: &str) -> Result<Self> {
        // 先只看版本号，避免对不认识的旧格式整体反序列化
        #[derive(Deserialize)]
        struct VersionProbe {
            version: Option<u32>,
        }
        let probe: VersionProbe = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("会话状态解析失败: {e}")))?;
        let found = probe.version.ok_or(Error::StateVersion { found: 0, supported: STATE_VERSION })?;
        if found < STATE_VERSION {
            return Err(Error::StateVersion { found, supported: STATE_VERSION });
        }
        // 更高版本尽力解析（serde 默认忽略未知字段）
        serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("会话状态解析失败: {e}")))
    }

    /// 0600 权限写盘
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(json.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionState {
        SessionState {
            version: STATE_VERSION,
            preset: "chrome-143".to_string(),
            forced_protocol: Some(Protocol::Http2),
            cookies: vec![Cookie::new("sid", "abc", "x.test")],
            tickets: Vec::new(),
            ech_configs: HashMap::from([("x.test".to_string(), "AQID".to_string())]),
            hints: HashMap::new(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let state = sample();
        let json = state.to_json().unwrap();
        let back = SessionState::from_json(&json).unwrap();
        assert_eq!(back.preset, "chrome-143");
        assert_eq!(back.forced_protocol, Some(Protocol::Http2));
        assert_eq!(back.cookies.len(), 1);
        assert_eq!(back.ech_configs["x.test"], "AQID");
    }

    #[test]
    fn test_lower_version_rejected() {
        let mut state = sample();
        state.version = 0;
        let json = state.to_json().unwrap();
        let err = SessionState::from_json(&json).unwrap_err();
        assert!(matches!(err, Error::StateVersion { found: 0, supported: 1 }));
    }

    #[test]
    fn test_missing_version_rejected() {
        let err = SessionState::from_json("{\"preset\":\"chrome-143\"}").unwrap_err();
        assert!(matches!(err, Error::StateVersion { .. }));
    }

    #[test]
    fn test_newer_version_best_effort() {
        let json = r#"{
            "version": 2,
            "preset": "chrome-143",
            "unknown_future_field": {"x": 1}
        }"#;
        let state = SessionState::from_json(json).unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.preset, "chrome-143");
        assert!(state.cookies.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_save_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("cloak-state-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.json");
        sample().save_to(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let back = SessionState::load_from(&path).unwrap();
        assert_eq!(back.preset, "chrome-143");
        std::fs::remove_dir_all(&dir).ok();
    }
}
