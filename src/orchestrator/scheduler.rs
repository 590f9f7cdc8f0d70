//! 恢复调度器 - 编排层
//!
//! ## 职责
//!
//! 定期巡检"应当正在执行"的批次（IN_PROGRESS / RESUMING），
//! 把长时间没有活动的孤儿批次重新提交到有界工作池。
//!
//! ## 活跃判定
//!
//! 最近活动在活动窗口内，或最近巡检在巡检窗口内，视为仍有任务在执行。
//! 只有活动新鲜时才写入巡检时间，否则巡检时间会不断刷新，孤儿批次永远不会被发现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppResult, SchedulerError};
use crate::infrastructure::WorkStore;
use crate::models::{Batch, BatchId, BatchPatch, BatchStatus};
use crate::services::BatchStateManager;

/// 批次执行者，由生成引擎实现
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, batch_id: BatchId) -> AppResult<()>;
}

/// 巡检结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub checked: usize,
    pub dispatched: usize,
}

pub struct RecoveryScheduler {
    store: Arc<dyn WorkStore>,
    state: Arc<BatchStateManager>,
    executor: Arc<dyn BatchExecutor>,
    interval: Duration,
    activity_window: chrono::Duration,
    check_window: chrono::Duration,
    shutdown_timeout: Duration,
    semaphore: Arc<Semaphore>,
    workers: tokio::sync::Mutex<JoinSet<()>>,
    /// 每个批次在本进程工作池中的任务数
    in_flight: Arc<Mutex<HashMap<BatchId, usize>>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}

impl RecoveryScheduler {
    pub fn new(config: &Config, state: Arc<BatchStateManager>, executor: Arc<dyn BatchExecutor>) -> Self {
        Self {
            store: state.coordinator().store().clone(),
            state,
            executor,
            interval: config.scheduler_interval(),
            activity_window: to_chrono(config.activity_window()),
            check_window: to_chrono(config.check_window()),
            shutdown_timeout: config.shutdown_timeout(),
            semaphore: Arc::new(Semaphore::new(config.worker_pool_size)),
            workers: tokio::sync::Mutex::new(JoinSet::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            ticker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 本进程工作池中是否有该批次的任务
    pub fn is_in_flight(&self, batch_id: BatchId) -> bool {
        self.in_flight
            .lock()
            .map(|tasks| tasks.contains_key(&batch_id))
            .unwrap_or(false)
    }

    /// 启动调度器，立即执行一次巡检
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("恢复调度器已在运行");
            return;
        }

        let token = CancellationToken::new();
        if let Ok(mut cancel) = self.cancel.lock() {
            *cancel = token.clone();
        }

        let scheduler = self.clone();
        let mut ticker = tokio::time::interval(self.interval);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("恢复调度器巡检循环退出");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.check_orphans().await {
                            error!("恢复调度器巡检失败: {}", e);
                        }
                    }
                }
            }
        });
        if let Ok(mut ticker) = self.ticker.lock() {
            *ticker = Some(handle);
        }
        info!("🛰 恢复调度器已启动，巡检间隔 {:?}", self.interval);
    }

    /// 停止调度器：先停止巡检，再在限定时间内等待工作池排空，超时后强制中止
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(cancel) = self.cancel.lock() {
            cancel.cancel();
        }
        let ticker = self.ticker.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = ticker {
            let _ = handle.await;
        }

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("工作池在 {:?} 内未排空，强制中止剩余任务", self.shutdown_timeout);
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            if let Ok(mut in_flight) = self.in_flight.lock() {
                in_flight.clear();
            }
        }
        info!("🛑 恢复调度器已停止");
    }

    /// 批次是否仍有任务在执行
    pub fn has_active_task(&self, batch: &Batch, now: DateTime<Utc>) -> bool {
        self.activity_is_fresh(batch, now)
            || batch
                .last_check_time
                .is_some_and(|t| now - t <= self.check_window)
    }

    fn activity_is_fresh(&self, batch: &Batch, now: DateTime<Utc>) -> bool {
        batch
            .last_activity_time
            .is_some_and(|t| now - t <= self.activity_window)
    }

    /// 执行一次巡检
    pub async fn check_orphans(&self) -> AppResult<CheckReport> {
        let batches = self
            .store
            .batches_by_status(&[BatchStatus::InProgress, BatchStatus::Resuming])
            .await?;
        let now = Utc::now();
        let mut report = CheckReport {
            checked: batches.len(),
            ..CheckReport::default()
        };

        for batch in batches {
            if self.has_active_task(&batch, now) {
                if self.activity_is_fresh(&batch, now) {
                    self.store
                        .update_batch(batch.id, BatchPatch::new().checked(now))
                        .await?;
                }
                debug!("[批次 {}] 仍在执行，跳过", batch.id);
                continue;
            }

            warn!(
                "[批次 {}] 🔁 发现孤儿批次（状态 {}，最近活动 {:?}），重新提交",
                batch.id, batch.status, batch.last_activity_time
            );
            self.store
                .update_batch(batch.id, BatchPatch::new().touch(now))
                .await?;
            match self.submit(batch.id, false).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => {}
                Err(e) => warn!("[批次 {}] 重新提交失败: {}", batch.id, e),
            }
        }

        if report.dispatched > 0 {
            info!("巡检 {} 个批次，重新提交 {} 个", report.checked, report.dispatched);
        }
        Ok(report)
    }

    /// 提交批次到工作池
    ///
    /// # 参数
    /// - `batch_id`: 批次ID
    /// - `force`: 为 true 时即使本进程已有该批次的任务也再提交一次
    ///
    /// # 返回
    /// 是否实际提交
    pub async fn submit(&self, batch_id: BatchId, force: bool) -> AppResult<bool> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning(batch_id).into());
        }

        {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| SchedulerError::NotRunning(batch_id))?;
            let tasks = in_flight.entry(batch_id).or_insert(0);
            if *tasks > 0 && !force {
                debug!("[批次 {}] 已在工作池中，跳过提交", batch_id);
                return Ok(false);
            }
            *tasks += 1;
        }

        let semaphore = self.semaphore.clone();
        let executor = self.executor.clone();
        let state = self.state.clone();
        let in_flight = self.in_flight.clone();

        let mut workers = self.workers.lock().await;
        while workers.try_join_next().is_some() {}
        workers.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            info!("[批次 {}] ▶ 工作池开始处理", batch_id);

            let failure = match AssertUnwindSafe(executor.execute(batch_id)).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "未知错误".to_string());
                    Some(SchedulerError::WorkerPanicked { batch_id, message }.to_string())
                }
            };

            if let Some(message) = failure {
                if let Err(e) = state.fail_batch(batch_id, &message).await {
                    error!("[批次 {}] 标记失败状态时出错: {}", batch_id, e);
                }
            }

            // 同一批次可能还有强制提交的其他任务在执行，只减少自己的计数
            if let Ok(mut in_flight) = in_flight.lock() {
                if let Some(tasks) = in_flight.get_mut(&batch_id) {
                    *tasks = tasks.saturating_sub(1);
                    if *tasks == 0 {
                        in_flight.remove(&batch_id);
                    }
                }
            }
            info!("[批次 {}] ⏹ 工作池处理结束", batch_id);
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{BroadcastEventSink, MemoryCache, MemoryLockService, MemoryStore};
    use crate::services::{BatchCoordinator, InterruptRegistry, Notifier};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchExecutor for CountingExecutor {
        async fn execute(&self, _batch_id: BatchId) -> AppResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// 永远不返回的执行者，用于验证停止时的强制中止
    #[derive(Default)]
    struct StuckExecutor {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl BatchExecutor for StuckExecutor {
        async fn execute(&self, _batch_id: BatchId) -> AppResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler_with(executor: Arc<dyn BatchExecutor>) -> (Arc<RecoveryScheduler>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(BatchCoordinator::new(
            &Config::default(),
            Arc::new(MemoryLockService::new()),
            Arc::new(MemoryCache::new()),
            store.clone(),
        ));
        let state = Arc::new(BatchStateManager::new(
            coordinator,
            Arc::new(InterruptRegistry::new()),
            Notifier::new(Arc::new(BroadcastEventSink::default())),
        ));
        let scheduler = RecoveryScheduler::new(&Config::default(), state, executor);
        (Arc::new(scheduler), store)
    }

    fn scheduler() -> Arc<RecoveryScheduler> {
        scheduler_with(Arc::new(CountingExecutor::default())).0
    }

    /// 没有任何活动记录的执行中批次
    fn orphan(id: BatchId) -> Batch {
        let mut batch = Batch::new(id, "orphan", 1, 1);
        batch.status = BatchStatus::InProgress;
        batch
    }

    #[test]
    fn test_active_task_windows() {
        let scheduler = scheduler();
        let now = Utc::now();
        let mut batch = Batch::new(1, "b", 1, 1);

        batch.last_activity_time = Some(now - chrono::Duration::seconds(30));
        assert!(scheduler.has_active_task(&batch, now));

        batch.last_activity_time = Some(now - chrono::Duration::minutes(10));
        batch.last_check_time = Some(now - chrono::Duration::seconds(30));
        assert!(scheduler.has_active_task(&batch, now));

        batch.last_check_time = Some(now - chrono::Duration::minutes(10));
        assert!(!scheduler.has_active_task(&batch, now));

        batch.last_activity_time = None;
        batch.last_check_time = None;
        assert!(!scheduler.has_active_task(&batch, now));
    }

    #[tokio::test]
    async fn test_submit_requires_running_scheduler() {
        let scheduler = scheduler();
        let err = scheduler.submit(1, true).await.unwrap_err();
        assert!(err.to_string().contains("调度器未运行"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_dispatches_orphan_immediately() {
        let executor = Arc::new(CountingExecutor::default());
        let (scheduler, store) = scheduler_with(executor.clone());
        store.insert_batch(orphan(1)).await.unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        let batch = store.batch(1).await.unwrap().unwrap();
        assert!(batch.last_activity_time.is_some());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_loop_dispatches_without_manual_check() {
        let executor = Arc::new(CountingExecutor::default());
        let (scheduler, store) = scheduler_with(executor.clone());

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        store.insert_batch(orphan(2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_in_flight(2));
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_stuck_worker_after_timeout() {
        let executor = Arc::new(StuckExecutor::default());
        let (scheduler, _store) = scheduler_with(executor.clone());
        scheduler.start();

        assert!(scheduler.submit(3, false).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.started.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_in_flight(3));

        let begin = tokio::time::Instant::now();
        scheduler.stop().await;

        assert!(begin.elapsed() >= Config::default().shutdown_timeout());
        assert_eq!(executor.finished.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_running());
        assert!(!scheduler.is_in_flight(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_submit_keeps_batch_in_flight_until_last_worker() {
        let executor = Arc::new(StuckExecutor::default());
        let (scheduler, _store) = scheduler_with(executor.clone());
        scheduler.start();

        assert!(scheduler.submit(4, false).await.unwrap());
        assert!(!scheduler.submit(4, false).await.unwrap());
        assert!(scheduler.submit(4, true).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.started.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.in_flight.lock().unwrap().get(&4), Some(&2));

        scheduler.stop().await;
        assert!(!scheduler.is_in_flight(4));
    }
}
