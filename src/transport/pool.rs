//! 连接池
//!
//! 键：(origin, 协议, preset, 代理, 会话标识)。H1 连接单次独占，
//! 取出即离池、排干后归还；H2/H3 句柄多路复用，按在途流计数。
//! 淘汰时机：空闲超时、观测到协议错误、池容量压力（LRU）。
//! 在途计数护住清理与长流的竞争：计数非零的键推迟关闭，
//! 直到最后一个流结束或关闭截止时间到。

use super::h1::H1Conn;
use super::h2::H2Handle;
use super::h3::H3Handle;
use crate::error::Protocol;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 池键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub origin: String,
    pub protocol: Protocol,
    pub preset: String,
    pub proxy: Option<String>,
    pub session_id: Option<String>,
}

/// 池中的传输形态
pub enum Transport {
    H1(H1Conn),
    H2(H2Handle),
    H3(H3Handle),
}

impl Transport {
    pub fn protocol(&self) -> Protocol {
        match self {
            Transport::H1(_) => Protocol::Http1,
            Transport::H2(_) => Protocol::Http2,
            Transport::H3(_) => Protocol::Http3,
        }
    }
}

struct Entry {
    transport: Transport,
    idle_since: Instant,
    created: Instant,
}

/// 在途流守卫：drop 即计数递减
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_key: usize,
    pub max_entries: usize,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub close_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 4,
            max_entries: 64,
            idle_timeout: Duration::from_secs(90),
            max_lifetime: Duration::from_secs(600),
            close_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<PoolKey, Vec<Entry>>,
    in_flight: HashMap<PoolKey, Arc<AtomicUsize>>,
}

/// 连接池（会话内共享）
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Mutex<Inner>>,
    config: PoolConfig,
}

/// 统计快照
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub origin: String,
    pub protocol: Protocol,
    pub idle: usize,
    pub in_flight: usize,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), config }
    }

    /// 取一个可复用传输。H1 离池独占；H2/H3 克隆句柄留池。
    /// 返回的守卫在请求完成（体读完或连接放弃）时 drop。
    pub fn checkout(&self, key: &PoolKey) -> Option<(Transport, InFlightGuard)> {
        let mut inner = self.inner.lock().expect("pool poisoned");
        let now = Instant::now();
        let max_lifetime = self.config.max_lifetime;
        let idle_timeout = self.config.idle_timeout;

        let entries = inner.entries.get_mut(key)?;
        entries.retain(|e| {
            now.duration_since(e.created) < max_lifetime
                && now.duration_since(e.idle_since) < idle_timeout
        });

        let is_h1 = matches!(entries.last(), Some(Entry { transport: Transport::H1(_), .. }));
        let transport = if is_h1 {
            entries.pop()?.transport
        } else {
            let entry = entries.last_mut()?;
            entry.idle_since = now;
            match &entry.transport {
                Transport::H2(h) => Transport::H2(h.clone()),
                Transport::H3(h) => Transport::H3(h.clone()),
                Transport::H1(_) => unreachable!("is_h1 checked above"),
            }
        };

        let counter = inner.in_flight.entry(key.clone()).or_default().clone();
        counter.fetch_add(1, Ordering::SeqCst);
        Some((transport, InFlightGuard(counter)))
    }

    /// 为即将自行拨号的请求登记在途（握手不持池锁，占位即返回）
    pub fn reserve(&self, key: &PoolKey) -> InFlightGuard {
        let mut inner = self.inner.lock().expect("pool poisoned");
        let counter = inner.in_flight.entry(key.clone()).or_default().clone();
        counter.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(counter)
    }

    /// 归还/补位；顺手清掉各键的过期空闲连接
    pub fn put(&self, key: PoolKey, transport: Transport) {
        self.sweep();
        let mut inner = self.inner.lock().expect("pool poisoned");
        let now = Instant::now();
        let entries = inner.entries.entry(key).or_default();
        if entries.len() >= self.config.max_idle_per_key {
            entries.remove(0);
        }
        entries.push(Entry { transport, idle_since: now, created: now });

        // 总量压力：踢最久未用的键（在途为零的才允许）
        let total: usize = inner.entries.values().map(|v| v.len()).sum();
        if total > self.config.max_entries {
            let lru_key = inner
                .entries
                .iter()
                .filter(|(k, v)| {
                    !v.is_empty()
                        && inner
                            .in_flight
                            .get(k)
                            .map(|c| c.load(Ordering::SeqCst) == 0)
                            .unwrap_or(true)
                })
                .min_by_key(|(_, v)| v.iter().map(|e| e.idle_since).max())
                .map(|(k, _)| k.clone());
            if let Some(k) = lru_key {
                debug!("pool pressure: evicting {k:?}");
                inner.entries.remove(&k);
            }
        }
    }

    /// 协议错误后整键丢弃
    pub fn discard(&self, key: &PoolKey) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        inner.entries.remove(key);
    }

    /// 某键的在途流数
    pub fn in_flight(&self, key: &PoolKey) -> usize {
        let inner = self.inner.lock().expect("pool poisoned");
        inner.in_flight.get(key).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }

    /// 全池在途流数
    pub fn total_in_flight(&self) -> usize {
        let inner = self.inner.lock().expect("pool poisoned");
        inner.in_flight.values().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    /// 清空池。在途流的排空受 [`close_with_timeout`] 约束：
    /// 归零即继续，超时则排空转入后台、连接随 drop 关闭。
    pub async fn close_all(&self) {
        let pool = self.clone();
        close_with_timeout(
            async move { pool.wait_in_flight_zero().await },
            self.config.close_timeout,
        )
        .await;
        let mut inner = self.inner.lock().expect("pool poisoned");
        inner.entries.clear();
        inner.in_flight.clear();
    }

    async fn wait_in_flight_zero(&self) {
        while self.total_in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// 空闲清理
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        let now = Instant::now();
        for entries in inner.entries.values_mut() {
            entries.retain(|e| {
                now.duration_since(e.idle_since) < self.config.idle_timeout
                    && now.duration_since(e.created) < self.config.max_lifetime
            });
        }
        inner.entries.retain(|_, v| !v.is_empty());
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let inner = self.inner.lock().expect("pool poisoned");
        inner
            .entries
            .iter()
            .map(|(k, v)| PoolStats {
                origin: k.origin.clone(),
                protocol: k.protocol,
                idle: v.len(),
                in_flight: inner
                    .in_flight
                    .get(k)
                    .map(|c| c.load(Ordering::SeqCst))
                    .unwrap_or(0),
            })
            .collect()
    }
}

/// 限时关闭：收尾动作跑在独立任务上，最多等 `timeout`；
/// 超时后任务保持后台运行（detached），调用方不再阻塞
pub async fn close_with_timeout<F>(close: F, timeout: Duration)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(close);
    if tokio::time::timeout(timeout, handle).await.is_err() {
        debug!("close overran {timeout:?}; continuing detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(origin: &str, proto: Protocol) -> PoolKey {
        PoolKey {
            origin: origin.to_string(),
            protocol: proto,
            preset: "chrome-143".to_string(),
            proxy: None,
            session_id: None,
        }
    }

    #[test]
    fn test_checkout_empty() {
        let pool = Pool::new(PoolConfig::default());
        assert!(pool.checkout(&key("https://a.test:443", Protocol::Http2)).is_none());
    }

    #[test]
    fn test_in_flight_guard_counts() {
        let pool = Pool::new(PoolConfig::default());
        let k = key("https://a.test:443", Protocol::Http2);
        let g1 = pool.reserve(&k);
        let g2 = pool.reserve(&k);
        assert_eq!(pool.in_flight(&k), 2);
        drop(g1);
        assert_eq!(pool.in_flight(&k), 1);
        drop(g2);
        assert_eq!(pool.in_flight(&k), 0);
    }

    #[tokio::test]
    async fn test_close_all_waits_for_in_flight() {
        let config = PoolConfig { close_timeout: Duration::from_millis(200), ..Default::default() };
        let pool = Pool::new(config);
        let k = key("https://a.test:443", Protocol::Http2);
        let guard = pool.reserve(&k);

        let started = Instant::now();
        let pool2 = pool.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        pool2.close_all().await;
        // 在途归零后立即返回，而不是等满 close_timeout
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(190));
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_all_deadline_elapses() {
        let config = PoolConfig { close_timeout: Duration::from_millis(60), ..Default::default() };
        let pool = Pool::new(config);
        let k = key("https://a.test:443", Protocol::Http3);
        let _guard = pool.reserve(&k);

        let started = Instant::now();
        pool.close_all().await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_close_with_timeout_detaches() {
        let started = Instant::now();
        close_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
            },
            Duration::from_millis(30),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
