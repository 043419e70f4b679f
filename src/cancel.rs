//! 取消令牌
//!
//! 所有公开调用都接受一个带截止时间的取消令牌；任何网络等待都要
//! 与它 select 竞争，不允许裸 sleep / 裸 join。取消后挂起的读写
//! 以 `Error::Cancelled` 收尾。

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
}

/// 取消令牌（克隆共享同一状态）
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
    /// 父级取消状态；父取消传导给子，子取消不回流
    parent: Option<Arc<Shared>>,
    /// 绝对截止时间；None 表示只受显式取消约束
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带截止时间的令牌
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            parent: None,
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// 派生一个共享取消状态、但截止时间更紧的令牌
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(d) => Some(d.min(deadline)),
            None => Some(deadline),
        };
        Self { shared: self.shared.clone(), parent: self.parent.clone(), deadline }
    }

    /// 派生独立子令牌：随父取消，但取消子不影响父。
    /// 竞速的败方各持一个，赢家出线时单独掐掉败方。
    pub fn child(&self) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            parent: Some(self.shared.clone()),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .map(|p| p.cancelled.load(Ordering::SeqCst))
                .unwrap_or(false)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 截止时间前的剩余预算
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// 包住一个 future：取消返回 `Cancelled`，超时返回 `DeadlineExceeded`
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    biased;
                    _ = self.cancelled() => Err(Error::Cancelled),
                    r = tokio::time::timeout(timeout, fut) => match r {
                        Ok(inner) => inner,
                        Err(_) => Err(Error::DeadlineExceeded(timeout)),
                    },
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancelled() => Err(Error::Cancelled),
                    r = fut => r,
                }
            }
        }
    }

    /// 取消时完成的 future（select 用）
    pub async fn cancelled(&self) {
        match &self.parent {
            None => flag_wait(self.shared.as_ref()).await,
            Some(parent) => {
                tokio::select! {
                    _ = flag_wait(self.shared.as_ref()) => {}
                    _ = flag_wait(parent.as_ref()) => {}
                }
            }
        }
    }
}

/// 先注册唤醒再查标志，堵住 cancel() 与注册之间的窗口
async fn flag_wait(shared: &Shared) {
    let notified = shared.notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if shared.cancelled.load(Ordering::SeqCst) {
        return;
    }
    notified.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passthrough() {
        let token = CancelToken::new();
        let v = token.guard(async { Ok::<_, Error>(42) }).await.unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn test_guard_cancel() {
        let token = CancelToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t2.cancel();
        });
        let r: Result<()> = token.guard(std::future::pending()).await;
        assert!(matches!(r, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_guard_deadline() {
        let token = CancelToken::with_timeout(Duration::from_millis(20));
        let r: Result<()> = token.guard(std::future::pending()).await;
        assert!(matches!(r, Err(Error::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn test_already_cancelled_short_circuits() {
        let token = CancelToken::new();
        token.cancel();
        let r: Result<()> = token.guard(async { Ok(()) }).await;
        assert!(matches!(r, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        let watcher = child.clone();
        let handle = tokio::spawn(async move { watcher.cancelled().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        parent.cancel();
        assert!(child.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
