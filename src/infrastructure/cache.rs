//! 快速状态缓存 - 基础设施层
//!
//! 带 TTL 的字符串键值存储，用于在生成循环中低延迟地读取批次状态和中断标志。
//! 缓存不持有权威数据，任何时候都可以从工作存储重建。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{AppResult, StoreError};

/// 状态缓存
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    /// 重设过期时间；键不存在时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool>;
}

/// 内存版状态缓存，过期时间基于 tokio 时钟
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("缓存锁已中毒".to_string()).into())
    }
}

#[async_trait]
impl StateCache for MemoryCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.entries()?
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((_, deadline)) if *deadline > now => {
                *deadline = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
