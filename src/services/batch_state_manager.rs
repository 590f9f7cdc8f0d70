//! 批次状态管理 - 业务能力层
//!
//! 负责批次状态机的所有写操作：暂停、恢复、状态转换和缓存对账。
//! 每次写操作都在批次锁内完成，先校验转换表再同时写缓存和存储，
//! 释放锁之前回读存储确认写入结果。

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult, StateError, StoreError};
use crate::infrastructure::LockGuard;
use crate::models::{BatchId, BatchPatch, BatchStatus, EventKind, RunPatch, RunStatus};
use crate::services::{BatchCoordinator, InterruptRegistry, Notifier};

/// 恢复成功后、释放锁之前执行的回调
pub type ResumeCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// 批次状态管理器
///
/// 职责：
/// - 按转换表校验并执行批次状态转换
/// - 暂停时设置中断标志，恢复时清除（缓存和进程内两处）
/// - 缓存优先读取状态和中断标志
/// - 对账缓存与存储
pub struct BatchStateManager {
    coordinator: Arc<BatchCoordinator>,
    interrupts: Arc<InterruptRegistry>,
    notifier: Notifier,
}

impl BatchStateManager {
    pub fn new(coordinator: Arc<BatchCoordinator>, interrupts: Arc<InterruptRegistry>, notifier: Notifier) -> Self {
        Self {
            coordinator,
            interrupts,
            notifier,
        }
    }

    pub fn coordinator(&self) -> &Arc<BatchCoordinator> {
        &self.coordinator
    }

    pub fn interrupts(&self) -> &Arc<InterruptRegistry> {
        &self.interrupts
    }

    /// 在批次锁内执行操作，无论成功与否都释放锁
    async fn with_lock<T, F, Fut>(&self, batch_id: BatchId, guard: Box<dyn LockGuard>, op: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        debug!("[批次 {}] 获取到锁 {}", batch_id, guard.key());
        let result = op().await;
        match guard.release().await {
            Ok(true) => debug!("[批次 {}] 锁已释放", batch_id),
            Ok(false) => warn!("[批次 {}] 锁在释放前已过期", batch_id),
            Err(e) => warn!("[批次 {}] 释放锁失败: {}", batch_id, e),
        }
        result
    }

    async fn current_status(&self, batch_id: BatchId) -> AppResult<BatchStatus> {
        self.coordinator
            .store()
            .batch_status(batch_id)
            .await?
            .ok_or_else(|| StoreError::BatchNotFound(batch_id).into())
    }

    /// 回读存储，确认批次已处于期望状态
    async fn confirm(&self, batch_id: BatchId, expected: BatchStatus) -> AppResult<()> {
        let actual = self.coordinator.store().batch_status(batch_id).await?;
        if actual == Some(expected) {
            Ok(())
        } else {
            Err(StateError::NotConfirmed {
                batch_id,
                expected,
                actual,
            }
            .into())
        }
    }

    fn announce(&self, batch_id: BatchId, status: BatchStatus, message: &str) {
        self.notifier.status_change(batch_id, status.as_str(), message);
        self.notifier.batch_message(
            batch_id,
            EventKind::StatusChange,
            json!({ "batchId": batch_id, "status": status.as_str(), "message": message }),
        );
    }

    /// 暂停批次
    ///
    /// # 参数
    /// - `batch_id`: 批次ID
    /// - `reason`: 暂停原因
    ///
    /// # 返回
    /// 锁超时、转换不合法或写入后确认失败时返回错误，此时状态未被修改
    pub async fn pause(&self, batch_id: BatchId, reason: &str) -> AppResult<()> {
        let guard = self.coordinator.lock_batch(batch_id).await.map_err(|e| {
            warn!("[批次 {}] 无法获取锁，暂停操作失败", batch_id);
            e
        })?;

        self.with_lock(batch_id, guard, || async move {
            let from = self.current_status(batch_id).await?;
            info!("[批次 {}] 当前状态: {}，开始暂停", batch_id, from);
            if !from.can_transition_to(BatchStatus::Paused) {
                warn!("[批次 {}] 当前状态 {} 不允许转换为 PAUSED", batch_id, from);
                return Err(AppError::invalid_transition(batch_id, from, BatchStatus::Paused));
            }

            let now = Utc::now();
            let store = self.coordinator.store();
            store
                .update_batch(
                    batch_id,
                    BatchPatch::new()
                        .status(BatchStatus::Paused)
                        .paused(now, reason)
                        .touch(now),
                )
                .await?;
            let paused_runs = store
                .update_runs_for_batch(
                    batch_id,
                    RunPatch::new()
                        .expect_status(&RunStatus::PAUSABLE)
                        .status(RunStatus::Paused)
                        .paused(now, reason)
                        .touch(now),
                )
                .await?;
            info!("[批次 {}] 已暂停，同时暂停 {} 个运行", batch_id, paused_runs);
            self.confirm(batch_id, BatchStatus::Paused).await?;

            // 存储确认之后再写缓存，存储失败时缓存保持原样
            self.coordinator.set_interrupt_flag(batch_id, true).await?;
            self.interrupts.cancel(batch_id);
            self.coordinator.set_cached_status(batch_id, BatchStatus::Paused).await
        })
        .await?;

        self.announce(batch_id, BatchStatus::Paused, reason);
        Ok(())
    }

    /// 恢复批次
    ///
    /// 只有 PAUSED 状态的批次可以恢复。`on_committed` 在状态写入确认之后、
    /// 释放锁之前执行，用于把批次重新派发给执行者。
    pub async fn resume(&self, batch_id: BatchId, on_committed: Option<ResumeCallback>) -> AppResult<()> {
        let guard = self.coordinator.lock_batch(batch_id).await.map_err(|e| {
            warn!("[批次 {}] 无法获取锁，恢复操作失败", batch_id);
            e
        })?;

        self.with_lock(batch_id, guard, || async move {
            let from = self.current_status(batch_id).await?;
            info!("[批次 {}] 当前状态: {}，开始恢复", batch_id, from);
            if from != BatchStatus::Paused {
                warn!("[批次 {}] 当前状态 {} 不是 PAUSED，无法恢复", batch_id, from);
                return Err(AppError::invalid_transition(batch_id, from, BatchStatus::Resuming));
            }

            let now = Utc::now();
            let store = self.coordinator.store();
            store
                .update_batch(
                    batch_id,
                    BatchPatch::new()
                        .status(BatchStatus::Resuming)
                        .clear_pause()
                        .bump_resume_count()
                        .touch(now),
                )
                .await?;
            let resumed_runs = store
                .update_runs_for_batch(
                    batch_id,
                    RunPatch::new()
                        .expect_status(&[RunStatus::Paused])
                        .status(RunStatus::Resuming)
                        .clear_pause()
                        .bump_resume_count()
                        .touch(now),
                )
                .await?;
            info!("[批次 {}] 已恢复，同时恢复 {} 个运行", batch_id, resumed_runs);

            self.confirm(batch_id, BatchStatus::Resuming).await?;

            self.coordinator.set_interrupt_flag(batch_id, false).await?;
            self.interrupts.clear(batch_id);
            self.coordinator.set_cached_status(batch_id, BatchStatus::Resuming).await?;

            if let Some(callback) = on_committed {
                callback().await;
                info!("[批次 {}] 已触发恢复回调", batch_id);
            }
            Ok(())
        })
        .await?;

        self.announce(batch_id, BatchStatus::Resuming, "批次已恢复");
        Ok(())
    }

    /// 批次状态（缓存优先）
    pub async fn status(&self, batch_id: BatchId) -> AppResult<Option<BatchStatus>> {
        self.coordinator.status(batch_id).await
    }

    /// 批次是否被标记为中断（进程内令牌或缓存标志）
    pub async fn is_interrupted(&self, batch_id: BatchId) -> AppResult<bool> {
        if self.interrupts.is_cancelled(batch_id) {
            return Ok(true);
        }
        self.coordinator.interrupt_flag(batch_id).await
    }

    /// 对账缓存与存储：以存储为准修正缓存状态，并按状态重新推导中断标志
    pub async fn reconcile(&self, batch_id: BatchId) -> AppResult<()> {
        let guard = self.coordinator.lock_batch_briefly(batch_id).await?;

        self.with_lock(batch_id, guard, || async move {
            let Some(store_status) = self.coordinator.store().batch_status(batch_id).await? else {
                return Ok(());
            };
            let cached = self.coordinator.raw_cached_status(batch_id).await?;
            if cached.as_deref() != Some(store_status.as_str()) {
                info!(
                    "[批次 {}] 状态不一致，缓存: {:?}，存储: {}，以存储为准",
                    batch_id, cached, store_status
                );
                self.coordinator.set_cached_status(batch_id, store_status).await?;
            }

            match store_status {
                BatchStatus::Paused => {
                    self.coordinator.set_interrupt_flag(batch_id, true).await?;
                    self.interrupts.cancel(batch_id);
                }
                BatchStatus::Resuming | BatchStatus::InProgress => {
                    self.coordinator.set_interrupt_flag(batch_id, false).await?;
                    self.interrupts.clear(batch_id);
                }
                _ => {}
            }
            Ok(())
        })
        .await
    }

    /// 执行一次状态转换
    ///
    /// # 参数
    /// - `batch_id`: 批次ID
    /// - `target`: 目标状态
    /// - `error_message`: 转换为 FAILED 时记录的错误信息
    pub async fn transition(
        &self,
        batch_id: BatchId,
        target: BatchStatus,
        error_message: Option<&str>,
    ) -> AppResult<()> {
        let guard = self.coordinator.lock_batch(batch_id).await?;

        self.with_lock(batch_id, guard, || async move {
            let from = self.current_status(batch_id).await?;
            if !from.can_transition_to(target) {
                return Err(AppError::invalid_transition(batch_id, from, target));
            }
            self.write_status(batch_id, target, error_message).await?;
            info!("[批次 {}] 状态 {} -> {}", batch_id, from, target);
            Ok(())
        })
        .await?;

        self.announce(batch_id, target, error_message.unwrap_or(""));
        Ok(())
    }

    async fn write_status(&self, batch_id: BatchId, target: BatchStatus, error_message: Option<&str>) -> AppResult<()> {
        let now = Utc::now();
        let mut patch = BatchPatch::new().status(target).touch(now);
        if let Some(message) = error_message {
            patch = patch.error(message);
        }
        if matches!(target, BatchStatus::Completed | BatchStatus::Failed) {
            patch = patch.completed_at(now);
        }

        self.coordinator.store().update_batch(batch_id, patch).await?;
        self.confirm(batch_id, target).await?;

        self.coordinator.set_cached_status(batch_id, target).await?;
        if target.expects_active_task() {
            self.coordinator.set_interrupt_flag(batch_id, false).await?;
        }
        if matches!(target, BatchStatus::Completed | BatchStatus::Failed) {
            self.interrupts.clear(batch_id);
        }
        Ok(())
    }

    /// 生成任务开始前调用：PENDING 或 RESUMING 的批次进入 IN_PROGRESS
    ///
    /// # 返回
    /// 转换后的状态；不是 IN_PROGRESS 时调用方不应继续生成
    pub async fn begin_generation(&self, batch_id: BatchId) -> AppResult<BatchStatus> {
        let guard = self.coordinator.lock_batch(batch_id).await?;

        let (from, status) = self
            .with_lock(batch_id, guard, || async move {
                let from = self.current_status(batch_id).await?;
                match from {
                    BatchStatus::Pending | BatchStatus::Resuming => {
                        self.write_status(batch_id, BatchStatus::InProgress, None).await?;
                        Ok((from, BatchStatus::InProgress))
                    }
                    other => Ok((other, other)),
                }
            })
            .await?;

        if from != status {
            info!("[批次 {}] 状态 {} -> {}", batch_id, from, status);
            self.announce(batch_id, status, "开始生成回答");
        }
        Ok(status)
    }

    /// 把批次标记为失败，已失败的批次直接返回
    pub async fn fail_batch(&self, batch_id: BatchId, message: &str) -> AppResult<()> {
        error!("[批次 {}] 处理失败: {}", batch_id, message);
        let guard = self.coordinator.lock_batch(batch_id).await?;

        let changed = self
            .with_lock(batch_id, guard, || async move {
                let from = self.current_status(batch_id).await?;
                if from == BatchStatus::Failed {
                    return Ok(false);
                }
                self.write_status(batch_id, BatchStatus::Failed, Some(message)).await?;
                Ok(true)
            })
            .await?;

        if changed {
            self.announce(batch_id, BatchStatus::Failed, message);
            self.notifier.error(batch_id, message, Some(BatchStatus::Failed.as_str()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::infrastructure::{BroadcastEventSink, MemoryCache, MemoryLockService, MemoryStore, StateCache, WorkStore};
    use crate::models::{Answer, AnswerInsert, Batch, DatasetId, LlmModel, ModelId, Question, QuestionId, Run, RunId};
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        manager: BatchStateManager,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
    }

    async fn fixture(status: BatchStatus) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut batch = Batch::new(1, "批次", 1, 1);
        batch.status = status;
        store.insert_batch(batch).await.unwrap();
        let mut generating = Run::new(10, 1, 1, "运行A");
        generating.status = RunStatus::GeneratingAnswers;
        let mut completed = Run::new(11, 1, 1, "运行B");
        completed.status = RunStatus::Completed;
        store.insert_run(generating).await.unwrap();
        store.insert_run(completed).await.unwrap();

        let cache = Arc::new(MemoryCache::new());
        let coordinator = Arc::new(BatchCoordinator::new(
            &Config::default(),
            Arc::new(MemoryLockService::new()),
            cache.clone(),
            store.clone(),
        ));
        let manager = BatchStateManager::new(
            coordinator,
            Arc::new(InterruptRegistry::new()),
            Notifier::new(Arc::new(BroadcastEventSink::default())),
        );
        Fixture { manager, store, cache }
    }

    #[tokio::test]
    async fn test_pause_marks_batch_and_active_runs() {
        let f = fixture(BatchStatus::InProgress).await;
        f.manager.pause(1, "人工暂停").await.unwrap();

        let batch = f.store.batch(1).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Paused);
        assert_eq!(batch.pause_reason.as_deref(), Some("人工暂停"));
        assert_eq!(f.store.run_status(10).await.unwrap(), Some(RunStatus::Paused));
        assert_eq!(f.store.run_status(11).await.unwrap(), Some(RunStatus::Completed));
        assert_eq!(f.cache.get("batch:state:1").await.unwrap().as_deref(), Some("PAUSED"));
        assert!(f.manager.is_interrupted(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_runs_callback_before_release() {
        let f = fixture(BatchStatus::Paused).await;
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let coordinator = f.manager.coordinator().clone();

        let callback: ResumeCallback = Box::new(move || {
            async move {
                // 回调执行期间锁仍被持有
                assert!(coordinator.lock_batch_briefly(1).await.is_err());
                flag.store(true, Ordering::SeqCst);
            }
            .boxed()
        });
        f.manager.resume(1, Some(callback)).await.unwrap();

        assert!(called.load(Ordering::SeqCst));
        let batch = f.store.batch(1).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Resuming);
        assert_eq!(batch.resume_count, 1);
        assert_eq!(batch.pause_reason, None);
        assert!(!f.manager.is_interrupted(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_rejects_non_paused_batch() {
        let f = fixture(BatchStatus::InProgress).await;
        let err = f.manager.resume(1, None).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(f.store.batch_status(1).await.unwrap(), Some(BatchStatus::InProgress));
    }

    #[tokio::test]
    async fn test_reconcile_corrects_stale_cache() {
        let f = fixture(BatchStatus::Paused).await;
        f.cache.set("batch:state:1", "IN_PROGRESS", std::time::Duration::from_secs(60)).await.unwrap();
        f.cache.set("batch:interrupt:1", "false", std::time::Duration::from_secs(60)).await.unwrap();

        f.manager.reconcile(1).await.unwrap();

        assert_eq!(f.manager.status(1).await.unwrap(), Some(BatchStatus::Paused));
        assert!(f.manager.is_interrupted(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_batch_is_idempotent() {
        let f = fixture(BatchStatus::InProgress).await;
        f.manager.fail_batch(1, "数据集为空").await.unwrap();
        f.manager.fail_batch(1, "再次失败").await.unwrap();

        let batch = f.store.batch(1).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.error_message.as_deref(), Some("数据集为空"));
    }

    #[tokio::test]
    async fn test_terminal_status_drops_interrupt_token() {
        let f = fixture(BatchStatus::InProgress).await;
        let _ = f.manager.interrupts().token(1);
        assert_eq!(f.manager.interrupts().len(), 1);

        f.manager.transition(1, BatchStatus::Completed, None).await.unwrap();
        assert!(f.manager.interrupts().is_empty());
        assert!(!f.manager.is_interrupted(1).await.unwrap());
        assert!(f.manager.interrupts().is_empty());
    }

    /// 批次写入总是失败的存储，其余操作转发给内存存储
    struct RejectingBatchWrites(Arc<MemoryStore>);

    #[async_trait]
    impl WorkStore for RejectingBatchWrites {
        async fn allocate_batch_id(&self) -> AppResult<BatchId> {
            self.0.allocate_batch_id().await
        }
        async fn allocate_run_id(&self) -> AppResult<RunId> {
            self.0.allocate_run_id().await
        }
        async fn insert_batch(&self, batch: Batch) -> AppResult<()> {
            self.0.insert_batch(batch).await
        }
        async fn batch(&self, id: BatchId) -> AppResult<Option<Batch>> {
            self.0.batch(id).await
        }
        async fn batch_status(&self, id: BatchId) -> AppResult<Option<BatchStatus>> {
            self.0.batch_status(id).await
        }
        async fn batches_by_status(&self, statuses: &[BatchStatus]) -> AppResult<Vec<Batch>> {
            self.0.batches_by_status(statuses).await
        }
        async fn update_batch(&self, _id: BatchId, _patch: BatchPatch) -> AppResult<bool> {
            Err(StoreError::Unavailable("写入被拒绝".to_string()).into())
        }
        async fn insert_run(&self, run: Run) -> AppResult<()> {
            self.0.insert_run(run).await
        }
        async fn run(&self, id: RunId) -> AppResult<Option<Run>> {
            self.0.run(id).await
        }
        async fn run_status(&self, id: RunId) -> AppResult<Option<RunStatus>> {
            self.0.run_status(id).await
        }
        async fn runs_for_batch(&self, batch_id: BatchId) -> AppResult<Vec<Run>> {
            self.0.runs_for_batch(batch_id).await
        }
        async fn update_run(&self, id: RunId, patch: RunPatch) -> AppResult<bool> {
            self.0.update_run(id, patch).await
        }
        async fn update_runs_for_batch(&self, batch_id: BatchId, patch: RunPatch) -> AppResult<usize> {
            self.0.update_runs_for_batch(batch_id, patch).await
        }
        async fn model(&self, id: ModelId) -> AppResult<Option<LlmModel>> {
            self.0.model(id).await
        }
        async fn dataset_questions(&self, dataset_id: DatasetId) -> AppResult<Vec<Question>> {
            self.0.dataset_questions(dataset_id).await
        }
        async fn insert_answer(&self, answer: Answer) -> AppResult<AnswerInsert> {
            self.0.insert_answer(answer).await
        }
        async fn has_answer(&self, run_id: RunId, question_id: QuestionId, repeat_index: u32) -> AppResult<bool> {
            self.0.has_answer(run_id, question_id, repeat_index).await
        }
        async fn answers_for_run(&self, run_id: RunId) -> AppResult<Vec<Answer>> {
            self.0.answers_for_run(run_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_store_write_leaves_cache_untouched() {
        let inner = Arc::new(MemoryStore::new());
        let mut batch = Batch::new(1, "批次", 1, 1);
        batch.status = BatchStatus::InProgress;
        inner.insert_batch(batch).await.unwrap();

        let cache = Arc::new(MemoryCache::new());
        let coordinator = Arc::new(BatchCoordinator::new(
            &Config::default(),
            Arc::new(MemoryLockService::new()),
            cache.clone(),
            Arc::new(RejectingBatchWrites(inner.clone())),
        ));
        coordinator.set_cached_status(1, BatchStatus::InProgress).await.unwrap();
        coordinator.set_interrupt_flag(1, false).await.unwrap();
        let manager = BatchStateManager::new(
            coordinator,
            Arc::new(InterruptRegistry::new()),
            Notifier::new(Arc::new(BroadcastEventSink::default())),
        );

        assert!(manager.pause(1, "人工暂停").await.is_err());
        assert_eq!(cache.get("batch:state:1").await.unwrap().as_deref(), Some("IN_PROGRESS"));
        assert_eq!(cache.get("batch:interrupt:1").await.unwrap().as_deref(), Some("false"));
        assert!(!manager.is_interrupted(1).await.unwrap());

        assert!(manager.transition(1, BatchStatus::Paused, None).await.is_err());
        assert_eq!(cache.get("batch:state:1").await.unwrap().as_deref(), Some("IN_PROGRESS"));
        assert_eq!(inner.batch_status(1).await.unwrap(), Some(BatchStatus::InProgress));
    }

    #[tokio::test]
    async fn test_begin_generation_promotes_resuming() {
        let f = fixture(BatchStatus::Resuming).await;
        assert_eq!(f.manager.begin_generation(1).await.unwrap(), BatchStatus::InProgress);

        let f = fixture(BatchStatus::Paused).await;
        assert_eq!(f.manager.begin_generation(1).await.unwrap(), BatchStatus::Paused);
        assert_eq!(f.store.batch_status(1).await.unwrap(), Some(BatchStatus::Paused));
    }
}
