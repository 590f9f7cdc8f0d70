//! 批次协调器 - 业务能力层
//!
//! 把分布式锁、状态缓存和工作存储组合成三种能力：
//! 按批次互斥、带 TTL 的中断标志、缓存优先的状态读取（未命中时回源存储）

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::{LockGuard, LockService, StateCache, WorkStore};
use crate::models::{BatchId, BatchStatus, RunId};

const BATCH_STATE_PREFIX: &str = "batch:state:";
const BATCH_INTERRUPT_PREFIX: &str = "batch:interrupt:";
const BATCH_LOCK_PREFIX: &str = "batch:lock:";
const RUN_EXEC_PREFIX: &str = "run:exec:";

pub struct BatchCoordinator {
    locks: Arc<dyn LockService>,
    cache: Arc<dyn StateCache>,
    store: Arc<dyn WorkStore>,
    cache_ttl: Duration,
    lock_wait: Duration,
    lock_lease: Duration,
    reconcile_lock_wait: Duration,
    reconcile_lock_lease: Duration,
    run_lease: Duration,
}

impl BatchCoordinator {
    pub fn new(
        config: &Config,
        locks: Arc<dyn LockService>,
        cache: Arc<dyn StateCache>,
        store: Arc<dyn WorkStore>,
    ) -> Self {
        Self {
            locks,
            cache,
            store,
            cache_ttl: config.cache_ttl(),
            lock_wait: config.lock_wait(),
            lock_lease: config.lock_lease(),
            reconcile_lock_wait: config.reconcile_lock_wait(),
            reconcile_lock_lease: config.reconcile_lock_lease(),
            run_lease: config.run_lease(),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    pub fn run_lease(&self) -> Duration {
        self.run_lease
    }

    /// 获取批次锁，用于暂停、恢复和状态转换
    pub async fn lock_batch(&self, batch_id: BatchId) -> AppResult<Box<dyn LockGuard>> {
        self.locks
            .acquire(&format!("{}{}", BATCH_LOCK_PREFIX, batch_id), self.lock_wait, self.lock_lease)
            .await
    }

    /// 短时批次锁，用于缓存对账
    pub async fn lock_batch_briefly(&self, batch_id: BatchId) -> AppResult<Box<dyn LockGuard>> {
        self.locks
            .acquire(
                &format!("{}{}", BATCH_LOCK_PREFIX, batch_id),
                self.reconcile_lock_wait,
                self.reconcile_lock_lease,
            )
            .await
    }

    /// 尝试获取运行的执行租约，不等待；已被其他执行者持有时返回 None
    pub async fn try_lease_run(&self, run_id: RunId) -> AppResult<Option<Box<dyn LockGuard>>> {
        match self
            .locks
            .acquire(&format!("{}{}", RUN_EXEC_PREFIX, run_id), Duration::ZERO, self.run_lease)
            .await
        {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.is_lock_timeout() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_cached_status(&self, batch_id: BatchId, status: BatchStatus) -> AppResult<()> {
        self.cache
            .set(&format!("{}{}", BATCH_STATE_PREFIX, batch_id), status.as_str(), self.cache_ttl)
            .await
    }

    /// 缓存中的原始状态，不回源
    pub async fn raw_cached_status(&self, batch_id: BatchId) -> AppResult<Option<String>> {
        self.cache.get(&format!("{}{}", BATCH_STATE_PREFIX, batch_id)).await
    }

    /// 缓存优先读取批次状态，未命中或缓存值无法解析时回源存储并回填
    pub async fn status(&self, batch_id: BatchId) -> AppResult<Option<BatchStatus>> {
        if let Some(raw) = self.raw_cached_status(batch_id).await? {
            match raw.parse::<BatchStatus>() {
                Ok(status) => return Ok(Some(status)),
                Err(e) => warn!("[批次 {}] 缓存状态异常，回源存储: {}", batch_id, e),
            }
        }

        let status = self.store.batch_status(batch_id).await?;
        if let Some(status) = status {
            debug!("[批次 {}] 缓存未命中，从存储回填状态 {}", batch_id, status);
            self.set_cached_status(batch_id, status).await?;
        }
        Ok(status)
    }

    pub async fn set_interrupt_flag(&self, batch_id: BatchId, interrupted: bool) -> AppResult<()> {
        self.cache
            .set(
                &format!("{}{}", BATCH_INTERRUPT_PREFIX, batch_id),
                if interrupted { "true" } else { "false" },
                self.cache_ttl,
            )
            .await
    }

    /// 续期批次的状态缓存和中断标志，长时间运行的批次不会因 TTL 丢失缓存
    ///
    /// # 返回
    /// 中断标志是否仍在缓存中
    pub async fn refresh_cache_ttl(&self, batch_id: BatchId) -> AppResult<bool> {
        self.cache
            .expire(&format!("{}{}", BATCH_STATE_PREFIX, batch_id), self.cache_ttl)
            .await?;
        self.cache
            .expire(&format!("{}{}", BATCH_INTERRUPT_PREFIX, batch_id), self.cache_ttl)
            .await
    }

    /// 缓存优先读取中断标志；未命中时由存储状态推导（PAUSED 即中断）并回填
    pub async fn interrupt_flag(&self, batch_id: BatchId) -> AppResult<bool> {
        if let Some(value) = self
            .cache
            .get(&format!("{}{}", BATCH_INTERRUPT_PREFIX, batch_id))
            .await?
        {
            return Ok(value == "true");
        }

        match self.store.batch_status(batch_id).await? {
            Some(status) => {
                let interrupted = status == BatchStatus::Paused;
                self.set_interrupt_flag(batch_id, interrupted).await?;
                Ok(interrupted)
            }
            None => Ok(false),
        }
    }
}
