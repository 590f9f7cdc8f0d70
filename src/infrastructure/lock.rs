//! 分布式锁服务 - 基础设施层
//!
//! 基于租约的互斥锁：持有者崩溃后锁会在租约到期时自动释放。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{AppResult, StateError, StoreError};

/// 已获取的锁
#[async_trait]
pub trait LockGuard: Send + Sync {
    fn key(&self) -> &str;

    /// 释放锁；租约已过期且被他人重新获取时返回 false
    async fn release(&self) -> AppResult<bool>;

    /// 续租；锁已不属于当前持有者时返回 false
    async fn extend(&self, lease: Duration) -> AppResult<bool>;
}

/// 分布式锁服务
#[async_trait]
pub trait LockService: Send + Sync {
    /// 在 `wait` 内尝试获取锁，租约为 `lease`；超时返回 [`StateError::LockTimeout`]
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> AppResult<Box<dyn LockGuard>>;
}

struct Holder {
    token: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct LockTable {
    holders: Mutex<HashMap<String, Holder>>,
    released: Notify,
    next_token: AtomicU64,
}

impl LockTable {
    fn try_take(&self, key: &str, lease: Duration) -> AppResult<Option<u64>> {
        let mut holders = self
            .holders
            .lock()
            .map_err(|_| StoreError::Unavailable("锁表已中毒".to_string()))?;
        let now = Instant::now();
        if let Some(holder) = holders.get(key) {
            if holder.expires_at > now {
                return Ok(None);
            }
            debug!("锁 {} 的租约已过期，允许重新获取", key);
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        holders.insert(
            key.to_string(),
            Holder {
                token,
                expires_at: now + lease,
            },
        );
        Ok(Some(token))
    }
}

/// 内存版分布式锁服务（单进程内有效）
#[derive(Clone, Default)]
pub struct MemoryLockService {
    table: Arc<LockTable>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> AppResult<Box<dyn LockGuard>> {
        let started = Instant::now();
        let deadline = started + wait;
        loop {
            if let Some(token) = self.table.try_take(key, lease)? {
                return Ok(Box::new(MemoryLockGuard {
                    table: self.table.clone(),
                    key: key.to_string(),
                    token,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StateError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: (now - started).as_millis(),
                }
                .into());
            }

            // 释放通知或租约过期，两者取先到者
            let _ = tokio::time::timeout(
                (deadline - now).min(POLL_INTERVAL),
                self.table.released.notified(),
            )
            .await;
        }
    }
}

struct MemoryLockGuard {
    table: Arc<LockTable>,
    key: String,
    token: u64,
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    fn key(&self) -> &str {
        &self.key
    }

    async fn release(&self) -> AppResult<bool> {
        let released = {
            let mut holders = self
                .table
                .holders
                .lock()
                .map_err(|_| StoreError::Unavailable("锁表已中毒".to_string()))?;
            match holders.get(&self.key) {
                Some(holder) if holder.token == self.token => {
                    holders.remove(&self.key);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.table.released.notify_waiters();
        }
        Ok(released)
    }

    async fn extend(&self, lease: Duration) -> AppResult<bool> {
        let mut holders = self
            .table
            .holders
            .lock()
            .map_err(|_| StoreError::Unavailable("锁表已中毒".to_string()))?;
        match holders.get_mut(&self.key) {
            Some(holder) if holder.token == self.token => {
                holder.expires_at = Instant::now() + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
