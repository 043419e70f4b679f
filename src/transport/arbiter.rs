//! 协议仲裁
//!
//! 每请求决策：会话强制协议则照办；否则查 (origin, preset) 提示。
//! H3 可用（最近成功过、或尚无失败记录）时与 H2 竞速，H3 先发
//! ~200ms；先建成者胜，败者连同其取消令牌一起丢弃。
//! H3 建联失败（UDP 被阻断、握手超时）把 origin 钉在 H2 上一个
//! 冷却窗口。冷却随 save/load 持久化。预写式 CONNECT 的黑名单
//! 只活在会话内存里。

use crate::cancel::CancelToken;
use crate::error::{Error, Protocol, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

/// H3 竞速领先量
pub const H3_HEAD_START: Duration = Duration::from_millis(200);
/// H3 失败后的冷却窗口
pub const H3_COOLDOWN: Duration = Duration::from_secs(300);
/// preface 连续被拒这么多次后倾向 H1
const PREFACE_REJECT_LIMIT: u32 = 2;

/// 每 (origin, preset) 的仲裁提示；纯建议性，丢了只损性能
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginHint {
    pub last_good: Option<Protocol>,
    /// H3 冷却截止（绝对时刻，可持久化）
    pub h3_cooldown_until: Option<SystemTime>,
    /// 观测到过 h3 的 Alt-Svc 通告
    pub alt_svc_h3: bool,
    pub h2_preface_rejects: u32,
}

/// 单请求的协议计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Only(Protocol),
    /// H3 与 H2 竞速（H3 领先起跑）
    RaceH3H2,
}

#[derive(Default)]
struct Inner {
    hints: HashMap<String, OriginHint>,
    /// (代理键, 协议) 的预写式 CONNECT 黑名单
    speculative_blocked: HashSet<(String, Protocol)>,
}

/// 仲裁提示表（每会话独立；fork 不共享）
#[derive(Clone, Default)]
pub struct Arbiter {
    inner: Arc<RwLock<Inner>>,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hint(&self, origin_key: &str) -> OriginHint {
        self.inner
            .read()
            .expect("arbiter poisoned")
            .hints
            .get(origin_key)
            .cloned()
            .unwrap_or_default()
    }

    /// 依据提示与 preset 支持面定协议计划
    pub fn plan(&self, origin_key: &str, supports_h3: bool, supports_h2: bool) -> Plan {
        if !supports_h2 {
            return Plan::Only(Protocol::Http1);
        }
        if !supports_h3 {
            return Plan::Only(Protocol::Http2);
        }
        let hint = self.hint(origin_key);
        if hint.h2_preface_rejects >= PREFACE_REJECT_LIMIT {
            return Plan::Only(Protocol::Http1);
        }
        if self.h3_in_cooldown(&hint) {
            return Plan::Only(Protocol::Http2);
        }
        match hint.last_good {
            Some(Protocol::Http3) => Plan::RaceH3H2,
            Some(Protocol::Http2) if !hint.alt_svc_h3 => Plan::Only(Protocol::Http2),
            Some(Protocol::Http1) => Plan::Only(Protocol::Http1),
            // 无历史或有 Alt-Svc 通告：试探 H3，H2 兜底
            _ => Plan::RaceH3H2,
        }
    }

    fn h3_in_cooldown(&self, hint: &OriginHint) -> bool {
        matches!(hint.h3_cooldown_until, Some(until) if SystemTime::now() < until)
    }

    pub fn record_success(&self, origin_key: &str, protocol: Protocol) {
        let mut inner = self.inner.write().expect("arbiter poisoned");
        let hint = inner.hints.entry(origin_key.to_string()).or_default();
        hint.last_good = Some(protocol);
        if protocol == Protocol::Http3 {
            hint.h3_cooldown_until = None;
        }
        if protocol == Protocol::Http2 {
            hint.h2_preface_rejects = 0;
        }
    }

    /// H3 建联失败：钉在 H2 上一个冷却窗口
    pub fn record_h3_failure(&self, origin_key: &str) {
        let mut inner = self.inner.write().expect("arbiter poisoned");
        let hint = inner.hints.entry(origin_key.to_string()).or_default();
        hint.h3_cooldown_until = Some(SystemTime::now() + H3_COOLDOWN);
        if hint.last_good == Some(Protocol::Http3) {
            hint.last_good = Some(Protocol::Http2);
        }
        debug!("h3 cooldown for {origin_key}");
    }

    pub fn record_h2_preface_reject(&self, origin_key: &str) {
        let mut inner = self.inner.write().expect("arbiter poisoned");
        let hint = inner.hints.entry(origin_key.to_string()).or_default();
        hint.h2_preface_rejects += 1;
    }

    /// 解析 Alt-Svc 响应头；出现 h3 通告就记下来
    pub fn observe_alt_svc(&self, origin_key: &str, alt_svc: &str) {
        if !alt_svc.split(',').any(|part| {
            matches!(part.trim().split('=').next(), Some(id) if id.trim() == "h3" || id.trim().starts_with("h3-"))
        }) {
            return;
        }
        let mut inner = self.inner.write().expect("arbiter poisoned");
        inner.hints.entry(origin_key.to_string()).or_default().alt_svc_h3 = true;
    }

    // ---- 预写式 CONNECT 黑名单 ----

    pub fn block_speculative(&self, proxy_key: &str, protocol: Protocol) {
        let mut inner = self.inner.write().expect("arbiter poisoned");
        inner.speculative_blocked.insert((proxy_key.to_string(), protocol));
    }

    pub fn speculative_blocked(&self, proxy_key: &str, protocol: Protocol) -> bool {
        let inner = self.inner.read().expect("arbiter poisoned");
        inner.speculative_blocked.contains(&(proxy_key.to_string(), protocol))
    }

    // ---- save/load ----

    pub fn snapshot(&self) -> HashMap<String, OriginHint> {
        self.inner.read().expect("arbiter poisoned").hints.clone()
    }

    pub fn restore(&self, hints: HashMap<String, OriginHint>) {
        self.inner.write().expect("arbiter poisoned").hints = hints;
    }
}

/// 竞速结果
pub enum RaceOutcome<A, B> {
    Primary(A),
    Secondary(B),
}

/// 先跑 primary，`head_start` 后放出 secondary；先成者胜。
/// 败者的取消令牌被触发后其 future 随 drop 终止。
pub async fn race_with_head_start<FA, FB, A, B>(
    primary: FA,
    secondary: FB,
    head_start: Duration,
    primary_cancel: &CancelToken,
    secondary_cancel: &CancelToken,
) -> Result<RaceOutcome<A, B>>
where
    FA: Future<Output = Result<A>>,
    FB: Future<Output = Result<B>>,
{
    tokio::pin!(primary);
    tokio::pin!(secondary);

    // 领先期：只有 primary 在跑
    let primary_err = tokio::select! {
        r = &mut primary => match r {
            Ok(a) => {
                secondary_cancel.cancel();
                return Ok(RaceOutcome::Primary(a));
            }
            Err(e) => Some(e),
        },
        _ = tokio::time::sleep(head_start) => None,
    };

    if let Some(e) = primary_err {
        // primary 在领先期内就输了：secondary 独跑
        if e.is_terminal() {
            return Err(e);
        }
        debug!("race primary lost in head start: {e}");
        let b = secondary.await?;
        return Ok(RaceOutcome::Secondary(b));
    }

    // 双方同跑
    tokio::select! {
        r = &mut primary => match r {
            Ok(a) => {
                secondary_cancel.cancel();
                Ok(RaceOutcome::Primary(a))
            }
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                debug!("race primary failed: {e}");
                Ok(RaceOutcome::Secondary(secondary.await?))
            }
        },
        r = &mut secondary => match r {
            Ok(b) => {
                primary_cancel.cancel();
                Ok(RaceOutcome::Secondary(b))
            }
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                debug!("race secondary failed: {e}");
                Ok(RaceOutcome::Primary(primary.await.map_err(|_| e)?))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_defaults_to_race() {
        let arb = Arbiter::new();
        assert_eq!(arb.plan("https://a.test:443", true, true), Plan::RaceH3H2);
    }

    #[test]
    fn test_plan_cooldown_pins_h2() {
        let arb = Arbiter::new();
        arb.record_h3_failure("https://a.test:443");
        assert_eq!(arb.plan("https://a.test:443", true, true), Plan::Only(Protocol::Http2));
    }

    #[test]
    fn test_success_clears_cooldown() {
        let arb = Arbiter::new();
        arb.record_h3_failure("https://a.test:443");
        arb.record_success("https://a.test:443", Protocol::Http3);
        assert_eq!(arb.plan("https://a.test:443", true, true), Plan::RaceH3H2);
    }

    #[test]
    fn test_h2_last_good_without_altsvc() {
        let arb = Arbiter::new();
        arb.record_success("https://a.test:443", Protocol::Http2);
        assert_eq!(arb.plan("https://a.test:443", true, true), Plan::Only(Protocol::Http2));
        // Alt-Svc 通告重开 H3 试探
        arb.observe_alt_svc("https://a.test:443", "h3=\":443\"; ma=86400");
        assert_eq!(arb.plan("https://a.test:443", true, true), Plan::RaceH3H2);
    }

    #[test]
    fn test_alt_svc_ignores_other_protocols() {
        let arb = Arbiter::new();
        arb.observe_alt_svc("https://a.test:443", "hq=\":443\"");
        assert!(!arb.hint("https://a.test:443").alt_svc_h3);
        arb.observe_alt_svc("https://a.test:443", "h3-29=\":443\", h2=\":443\"");
        assert!(arb.hint("https://a.test:443").alt_svc_h3);
    }

    #[test]
    fn test_preface_rejects_prefer_h1() {
        let arb = Arbiter::new();
        arb.record_h2_preface_reject("https://a.test:443");
        assert_ne!(arb.plan("https://a.test:443", true, true), Plan::Only(Protocol::Http1));
        arb.record_h2_preface_reject("https://a.test:443");
        assert_eq!(arb.plan("https://a.test:443", true, true), Plan::Only(Protocol::Http1));
    }

    #[test]
    fn test_speculative_blocklist() {
        let arb = Arbiter::new();
        assert!(!arb.speculative_blocked("http://p:7070", Protocol::Http2));
        arb.block_speculative("http://p:7070", Protocol::Http2);
        assert!(arb.speculative_blocked("http://p:7070", Protocol::Http2));
        assert!(!arb.speculative_blocked("http://p:7070", Protocol::Http1));
    }

    #[test]
    fn test_snapshot_restore_keeps_cooldown() {
        let arb = Arbiter::new();
        arb.record_h3_failure("https://a.test:443");
        let snap = arb.snapshot();

        let other = Arbiter::new();
        other.restore(snap);
        assert_eq!(other.plan("https://a.test:443", true, true), Plan::Only(Protocol::Http2));
    }

    #[tokio::test]
    async fn test_race_primary_wins_in_head_start() {
        let c1 = CancelToken::new();
        let c2 = CancelToken::new();
        let out = race_with_head_start(
            async { Ok::<_, Error>("h3") },
            async { Ok::<_, Error>("h2") },
            Duration::from_millis(200),
            &c1,
            &c2,
        )
        .await
        .unwrap();
        assert!(matches!(out, RaceOutcome::Primary("h3")));
        assert!(c2.is_cancelled());
    }

    #[tokio::test]
    async fn test_race_secondary_wins_when_primary_slow() {
        let c1 = CancelToken::new();
        let c2 = CancelToken::new();
        let out = race_with_head_start(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>("h3")
            },
            async { Ok::<_, Error>("h2") },
            Duration::from_millis(10),
            &c1,
            &c2,
        )
        .await
        .unwrap();
        assert!(matches!(out, RaceOutcome::Secondary("h2")));
        assert!(c1.is_cancelled());
    }

    #[tokio::test]
    async fn test_race_primary_fails_fast_falls_back() {
        let c1 = CancelToken::new();
        let c2 = CancelToken::new();
        let out = race_with_head_start(
            async {
                Err::<&str, _>(Error::Http3Unavailable {
                    origin: "x".into(),
                    reason: "udp blocked".into(),
                })
            },
            async { Ok::<_, Error>("h2") },
            Duration::from_millis(200),
            &c1,
            &c2,
        )
        .await
        .unwrap();
        assert!(matches!(out, RaceOutcome::Secondary("h2")));
    }
}
