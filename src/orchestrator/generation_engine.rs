//! 回答生成引擎 - 编排层
//!
//! ## 职责
//!
//! 接收一个批次ID，把批次推进到 IN_PROGRESS，并发处理它的所有运行，
//! 最后根据运行结果汇总批次进度和终态。
//!
//! ## 失败处理
//!
//! - 单元级失败记录在运行上，不影响其他单元
//! - 运行级失败把运行标记为 FAILED，汇总时批次随之 FAILED
//! - 批次级失败（批次不存在、没有运行、数据集为空）直接把批次标记为 FAILED
//! - 锁竞争不算失败，留给恢复调度器稍后重新派发

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clients::LlmClient;
use crate::config::Config;
use crate::error::{AppError, AppResult, StoreError};
use crate::infrastructure::WorkStore;
use crate::models::{BatchId, BatchPatch, BatchStatus, EventKind, Run, RunPatch, RunStatus};
use crate::orchestrator::run_processor::{RunOutcome, RunProcessor};
use crate::orchestrator::scheduler::BatchExecutor;
use crate::services::{BatchStateManager, Notifier, PromptAssembler};
use crate::utils::logging;
use crate::workflow::CellFlow;

/// 批次进度：运行进度的算术平均，保留两位小数
pub fn batch_progress(runs: &[Run]) -> f64 {
    if runs.is_empty() {
        return 0.0;
    }
    let sum: f64 = runs.iter().map(|r| r.progress_percentage).sum();
    (sum / runs.len() as f64 * 100.0).round() / 100.0
}

pub struct GenerationEngine {
    store: Arc<dyn WorkStore>,
    state: Arc<BatchStateManager>,
    runs: RunProcessor,
    notifier: Notifier,
}

impl GenerationEngine {
    pub fn new(
        config: &Config,
        state: Arc<BatchStateManager>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<dyn PromptAssembler>,
        notifier: Notifier,
    ) -> Self {
        let store = state.coordinator().store().clone();
        let cell_flow = CellFlow::new(store.clone(), llm, prompts, notifier.clone(), config.verbose_logging);
        Self {
            store,
            runs: RunProcessor::new(state.clone(), cell_flow, notifier.clone()),
            state,
            notifier,
        }
    }

    /// 生成入口
    ///
    /// 批次级错误在这里转换为 FAILED，不会传给调用方
    pub async fn generate(&self, batch_id: BatchId) -> AppResult<()> {
        match self.generate_inner(batch_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_lock_timeout() => {
                warn!("[批次 {}] 批次锁被占用，本次派发放弃: {}", batch_id, e);
                Ok(())
            }
            Err(e) => self.fail_dispatch(batch_id, e).await,
        }
    }

    async fn fail_dispatch(&self, batch_id: BatchId, cause: AppError) -> AppResult<()> {
        let message = cause.to_string();
        error!("[批次 {}] ❌ 生成任务失败: {}", batch_id, message);

        if matches!(cause, AppError::Store(StoreError::BatchNotFound(_))) {
            self.notifier.error(batch_id, &message, None);
            return Ok(());
        }

        self.store
            .update_runs_for_batch(
                batch_id,
                RunPatch::new()
                    .expect_status(&[
                        RunStatus::Pending,
                        RunStatus::GeneratingAnswers,
                        RunStatus::Resuming,
                    ])
                    .status(RunStatus::Failed)
                    .error(message.as_str()),
            )
            .await?;
        self.state.fail_batch(batch_id, &message).await
    }

    async fn generate_inner(&self, batch_id: BatchId) -> AppResult<()> {
        while self.run_pass(batch_id).await? {
            info!("[批次 {}] 🔁 处理中被暂停后又恢复，本任务继续接手", batch_id);
        }
        Ok(())
    }

    /// 处理一遍批次的所有运行
    ///
    /// # 返回
    /// 有运行因中断退出、而批次此时已恢复为执行状态时返回 true，调用方需要再处理一遍。
    /// 恢复时新派发的任务拿不到仍被本任务持有的执行租约，只能由本任务接手。
    async fn run_pass(&self, batch_id: BatchId) -> AppResult<bool> {
        let batch = self
            .store
            .batch(batch_id)
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        let status = self.state.begin_generation(batch_id).await?;
        if status != BatchStatus::InProgress {
            info!("[批次 {}] 当前状态为 {}，无需生成", batch_id, status);
            return Ok(false);
        }

        let runs = self.store.runs_for_batch(batch_id).await?;
        if runs.is_empty() {
            return Err(StoreError::NoRuns(batch_id).into());
        }

        let questions = self.store.dataset_questions(batch.dataset_id).await?;
        if questions.is_empty() {
            return Err(StoreError::EmptyDataset(batch.dataset_id).into());
        }

        info!(
            "[批次 {}] 📦 开始生成: {} 个运行 × {} 个问题 × 重复 {} 次",
            batch_id,
            runs.len(),
            questions.len(),
            batch.repeat_count
        );
        self.notifier.batch_message(
            batch_id,
            EventKind::TaskStarted,
            json!({ "batchId": batch_id, "runs": runs.len(), "questions": questions.len() }),
        );

        let interrupt = self.state.interrupts().token(batch_id);
        let outcomes = join_all(
            runs.iter()
                .map(|run| self.runs.process(&batch, run, &questions, &interrupt)),
        )
        .await;

        for (run, outcome) in runs.iter().zip(&outcomes) {
            match outcome {
                Ok(RunOutcome::Failed(message)) => warn!("[批次 {}] 运行 {} 失败: {}", batch_id, run.id, message),
                Ok(outcome) => info!("[批次 {}] 运行 {} 结果: {:?}", batch_id, run.id, outcome),
                Err(e) => error!("[批次 {}] 运行 {} 异常: {}", batch_id, run.id, e),
            }
        }
        let interrupted = outcomes
            .iter()
            .any(|o| matches!(o, Ok(RunOutcome::Interrupted)));
        if let Some(Err(e)) = outcomes.into_iter().find(|o| o.is_err()) {
            return Err(e);
        }

        self.aggregate(batch_id).await?;

        if !interrupted {
            return Ok(false);
        }
        let resumed = self
            .state
            .status(batch_id)
            .await?
            .is_some_and(BatchStatus::expects_active_task);
        Ok(resumed && !self.state.is_interrupted(batch_id).await?)
    }

    /// 汇总运行结果：更新批次进度，所有运行都结束时写入批次终态
    async fn aggregate(&self, batch_id: BatchId) -> AppResult<()> {
        let runs = self.store.runs_for_batch(batch_id).await?;
        let progress = batch_progress(&runs);
        self.store
            .update_batch(batch_id, BatchPatch::new().progress(progress))
            .await?;
        self.notifier.batch_message(
            batch_id,
            EventKind::ProgressUpdate,
            json!({ "batchId": batch_id, "progress": progress }),
        );

        if !runs.iter().all(|r| r.status.is_terminal()) {
            info!("[批次 {}] 仍有运行未结束，进度 {:.2}%", batch_id, progress);
            return Ok(());
        }

        let failed: Vec<&Run> = runs.iter().filter(|r| r.status == RunStatus::Failed).collect();
        let result = if failed.is_empty() {
            self.state.transition(batch_id, BatchStatus::Completed, None).await
        } else {
            let message = format!(
                "{} 个运行失败: {}",
                failed.len(),
                failed
                    .iter()
                    .map(|r| r.error_message.clone().unwrap_or_else(|| r.name.clone()))
                    .collect::<Vec<_>>()
                    .join("; ")
            );
            self.state.fail_batch(batch_id, &message).await
        };

        match result {
            Ok(()) => {
                logging::log_batch_summary(batch_id, &runs, progress);
                self.notifier.batch_message(
                    batch_id,
                    EventKind::TaskCompleted,
                    json!({ "batchId": batch_id, "progress": progress }),
                );
                Ok(())
            }
            Err(e) if e.is_invalid_transition() => {
                info!("[批次 {}] 所有运行已结束，但批次状态已改变，保持不动: {}", batch_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BatchExecutor for GenerationEngine {
    async fn execute(&self, batch_id: BatchId) -> AppResult<()> {
        self.generate(batch_id).await
    }
}
