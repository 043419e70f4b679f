//! 会话生命周期
//!
//! fork 的 cookie 共享、refresh 的状态保留、save/load 的版本门禁、
//! 票据缓存随会话标识隔离。

use cloak::tickets::TicketRecord;
use cloak::{Error, Protocol, Session, SessionState};
use std::time::{Duration, SystemTime};

fn ticket(origin: &str) -> TicketRecord {
    TicketRecord {
        origin: origin.to_string(),
        preset: "chrome-143".to_string(),
        protocol: Protocol::Http3,
        ticket: vec![0xaa; 16],
        max_early_data: 0xffff_ffff,
        ech_config: None,
        expires_at: SystemTime::now() + Duration::from_secs(3600),
        session_id: None,
    }
}

#[test]
fn test_fork_cookie_visibility() {
    let parent = Session::new("chrome-143").unwrap();
    parent.set_cookie("sid", "abc", "x.test", None);

    let forks = parent.fork(2);
    let (a, b) = (&forks[0], &forks[1]);

    // A 能看到父写入的 cookie
    let cookies = a.get_cookies();
    assert_eq!(cookies.len(), 1);
    assert_eq!(cookies[0].value, "abc");

    // B 改写后 A 立即可见
    b.set_cookie("sid", "xyz", "x.test", None);
    let cookies = a.get_cookies();
    assert_eq!(cookies.len(), 1);
    assert_eq!(cookies[0].value, "xyz");
}

#[tokio::test]
async fn test_refresh_preserves_tickets_and_cookies() {
    let session = Session::new("chrome-143").unwrap();
    session.set_cookie("sid", "abc", "y.test", None);

    // 模拟一次 H3 握手后的票据落库
    let snapshot = session.snapshot();
    let mut state = snapshot;
    state.tickets.push(ticket("y.test"));
    let session = Session::from_state(state).unwrap();

    session.refresh(None).await;

    // jar 与票据缓存原样保留
    assert_eq!(session.get_cookies().len(), 1);
    let restored = session.snapshot();
    assert_eq!(restored.tickets.len(), 1);
    assert!(restored.tickets[0].allows_early_data());
    session.close().await;
}

#[tokio::test]
async fn test_refresh_switch_protocol_persists() {
    let session = Session::new("chrome-143").unwrap();
    session.refresh(Some(Protocol::Http2)).await;
    assert_eq!(session.snapshot().forced_protocol, Some(Protocol::Http2));
    // 后续 refresh 不回退
    session.refresh(None).await;
    assert_eq!(session.snapshot().forced_protocol, Some(Protocol::Http2));
    session.close().await;
}

#[test]
fn test_save_load_roundtrip() {
    let dir = std::env::temp_dir().join(format!("cloak-lifecycle-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("session.json");

    let session = Session::builder("firefox-133").build().unwrap();
    session.set_cookie("token", "t1", "a.test", Some("/api"));
    session.save(&path).unwrap();

    let restored = Session::load(&path).unwrap();
    assert_eq!(restored.preset_name(), "firefox-133");
    let cookies = restored.get_cookies();
    assert_eq!(cookies.len(), 1);
    assert_eq!(cookies[0].path, "/api");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_load_rejects_lower_version() {
    let json = r#"{"version": 0, "preset": "chrome-143"}"#;
    let err = SessionState::from_json(json).unwrap_err();
    assert!(matches!(err, Error::StateVersion { found: 0, .. }));
}

#[test]
fn test_ticket_isolation_by_session_identifier() {
    let session = Session::builder("chrome-143").session_identifier("tenant-a").build().unwrap();
    let mut record = ticket("y.test");
    record.session_id = Some("tenant-a".to_string());

    let state = {
        let mut s = session.snapshot();
        s.tickets.push(record);
        s
    };
    let session = Session::from_state(state).unwrap();
    let tickets = session.snapshot().tickets;
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].session_id.as_deref(), Some("tenant-a"));
}

#[tokio::test]
async fn test_warmup_on_unreachable_root_errors() {
    // 根文档失败要上浮（子资源错误才吞）
    let session = Session::builder("chrome-143")
        .timeout(Duration::from_millis(500))
        .max_retries(0)
        .http_version(Protocol::Http1)
        .build()
        .unwrap();
    let err = session.warmup("http://192.0.2.1:81/").await;
    assert!(err.is_err());
    session.close().await;
}
