//! TLS 会话票据缓存
//!
//! 票据按 (origin, preset, protocol, 会话标识) 归档：同一进程里托管多个
//! 逻辑身份时，会话标识把共享后端里的键隔离开。
//! NewSessionTicket 到达时写入；过期、后端信号或会话关闭时退出。
//! rustls 的恢复存储走 `raw` 键值面（不透明 kv），HTTP/3 的 0-RTT
//! 决策走记录面。

use crate::error::Protocol;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// 一条票据记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRecord {
    /// SNI
    pub origin: String,
    pub preset: String,
    pub protocol: Protocol,
    /// 不透明票据内容
    #[serde(with = "blob_base64")]
    pub ticket: Vec<u8>,
    pub max_early_data: u32,
    /// 握手时使用的 ECH 配置（base64）
    pub ech_config: Option<String>,
    pub expires_at: SystemTime,
    /// 共享后端里的隔离键
    pub session_id: Option<String>,
}

impl TicketRecord {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() > self.expires_at
    }

    /// 0-RTT 可用：未过期且服务端允许 early data
    pub fn allows_early_data(&self) -> bool {
        !self.is_expired() && self.max_early_data > 0
    }
}

mod blob_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(v).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// 共享票据后端（例如集群内的 Redis 存储）
///
/// 后端 IO 全部异步；失败通过注册时给的回调上报，不阻塞握手路径。
pub trait TicketBackend: Send + Sync {
    fn store(&self, record: TicketRecord) -> BoxFuture<'static, std::io::Result<()>>;
    fn load(&self, origin: &str, session_id: Option<&str>)
        -> BoxFuture<'static, std::io::Result<Vec<TicketRecord>>>;
    fn remove(&self, origin: &str, session_id: Option<&str>)
        -> BoxFuture<'static, std::io::Result<()>>;
}

pub type BackendErrorHook = Arc<dyn Fn(std::io::Error) + Send + Sync>;

type RecordKey = (String, String, Protocol, Option<String>);

#[derive(Default)]
struct Inner {
    records: HashMap<RecordKey, TicketRecord>,
}

/// 票据缓存（克隆即共享，fork 的兄弟会话共用一份）
#[derive(Clone, Default)]
pub struct TicketCache {
    inner: Arc<RwLock<Inner>>,
    backend: Arc<RwLock<Option<(Arc<dyn TicketBackend>, BackendErrorHook)>>>,
}

impl std::fmt::Debug for TicketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("ticket cache poisoned");
        f.debug_struct("TicketCache").field("records", &inner.records.len()).finish()
    }
}

impl TicketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册共享后端；之后的写入同步进内存并异步推给后端
    pub fn register_backend(&self, backend: Arc<dyn TicketBackend>, on_error: BackendErrorHook) {
        *self.backend.write().expect("ticket cache poisoned") = Some((backend, on_error));
    }

    /// NewSessionTicket 落库
    pub fn insert(&self, record: TicketRecord) {
        let key = (
            record.origin.clone(),
            record.preset.clone(),
            record.protocol,
            record.session_id.clone(),
        );
        self.inner
            .write()
            .expect("ticket cache poisoned")
            .records
            .insert(key, record.clone());

        if let Some((backend, on_error)) = self.backend.read().expect("ticket cache poisoned").clone()
        {
            tokio::spawn(async move {
                if let Err(e) = backend.store(record).await {
                    on_error(e);
                }
            });
        }
    }

    /// 取某 origin+preset+协议的有效票据
    pub fn get(
        &self,
        origin: &str,
        preset: &str,
        protocol: Protocol,
        session_id: Option<&str>,
    ) -> Option<TicketRecord> {
        let key = (
            origin.to_string(),
            preset.to_string(),
            protocol,
            session_id.map(|s| s.to_string()),
        );
        let inner = self.inner.read().expect("ticket cache poisoned");
        inner.records.get(&key).filter(|r| !r.is_expired()).cloned()
    }

    /// 后端信号或显式失效
    pub fn evict(&self, origin: &str) {
        let mut inner = self.inner.write().expect("ticket cache poisoned");
        inner.records.retain(|(o, _, _, _), _| o != origin);
    }

    /// 清理所有过期记录
    pub fn sweep_expired(&self) {
        let mut inner = self.inner.write().expect("ticket cache poisoned");
        inner.records.retain(|_, r| !r.is_expired());
    }

    // ---- save/load ----

    pub fn snapshot(&self) -> Vec<TicketRecord> {
        let inner = self.inner.read().expect("ticket cache poisoned");
        inner.records.values().filter(|r| !r.is_expired()).cloned().collect()
    }

    pub fn restore(&self, records: Vec<TicketRecord>) {
        let mut inner = self.inner.write().expect("ticket cache poisoned");
        inner.records.clear();
        for r in records {
            if r.is_expired() {
                continue;
            }
            let key = (r.origin.clone(), r.preset.clone(), r.protocol, r.session_id.clone());
            inner.records.insert(key, r);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("ticket cache poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(origin: &str, proto: Protocol, ttl: Duration) -> TicketRecord {
        TicketRecord {
            origin: origin.to_string(),
            preset: "chrome-143".to_string(),
            protocol: proto,
            ticket: vec![1, 2, 3],
            max_early_data: 0xffffffff,
            ech_config: None,
            expires_at: SystemTime::now() + ttl,
            session_id: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = TicketCache::new();
        cache.insert(record("y.test", Protocol::Http3, Duration::from_secs(600)));
        let hit = cache.get("y.test", "chrome-143", Protocol::Http3, None);
        assert!(hit.is_some());
        assert!(hit.unwrap().allows_early_data());
        assert!(cache.get("y.test", "chrome-143", Protocol::Http2, None).is_none());
    }

    #[test]
    fn test_expired_not_returned() {
        let cache = TicketCache::new();
        let mut r = record("y.test", Protocol::Http3, Duration::from_secs(600));
        r.expires_at = SystemTime::now() - Duration::from_secs(1);
        cache.insert(r);
        assert!(cache.get("y.test", "chrome-143", Protocol::Http3, None).is_none());
    }

    #[test]
    fn test_session_id_isolates() {
        let cache = TicketCache::new();
        let mut r = record("y.test", Protocol::Http3, Duration::from_secs(600));
        r.session_id = Some("tenant-a".to_string());
        cache.insert(r);
        assert!(cache.get("y.test", "chrome-143", Protocol::Http3, None).is_none());
        assert!(cache
            .get("y.test", "chrome-143", Protocol::Http3, Some("tenant-a"))
            .is_some());
    }

    #[test]
    fn test_evict_origin() {
        let cache = TicketCache::new();
        cache.insert(record("a.test", Protocol::Http3, Duration::from_secs(600)));
        cache.insert(record("b.test", Protocol::Http3, Duration::from_secs(600)));
        cache.evict("a.test");
        assert!(cache.get("a.test", "chrome-143", Protocol::Http3, None).is_none());
        assert!(cache.get("b.test", "chrome-143", Protocol::Http3, None).is_some());
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let cache = TicketCache::new();
        cache.insert(record("y.test", Protocol::Http3, Duration::from_secs(600)));
        let snap = cache.snapshot();

        let other = TicketCache::new();
        other.restore(snap);
        assert_eq!(other.len(), 1);
        assert!(other.get("y.test", "chrome-143", Protocol::Http3, None).is_some());
    }

    #[test]
    fn test_clone_shares() {
        let cache = TicketCache::new();
        let sibling = cache.clone();
        sibling.insert(record("y.test", Protocol::Http3, Duration::from_secs(600)));
        assert_eq!(cache.len(), 1);
    }
}
