//! 单个运行处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块负责遍历一个运行的全部工作单元，是运行级别的编排器。
//!
//! ## 核心功能
//!
//! 1. **执行租约**：同一运行同一时间只有一个执行者
//! 2. **遍历网格**：重复序号在外层，数据集顺序在内层
//! 3. **中断检查**：每个单元开始前检查，从不打断进行中的 LLM 调用
//! 4. **进度记录**：每个单元结束后写入计数、进度和观测游标
//! 5. **收尾**：网格走完时把运行标记为完成

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{AppResult, StoreError};
use crate::infrastructure::{LockGuard, WorkStore};
use crate::models::{Batch, BatchPatch, EventKind, LlmModel, Question, Run, RunPatch, RunStatus, WorkCell};
use crate::services::{BatchStateManager, Notifier};
use crate::workflow::{CellCtx, CellFlow, CellOutcome};

/// 运行处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// 网格已走完
    Completed,
    /// 在单元之间检测到中断
    Interrupted,
    /// 运行已是终态，或执行租约被其他执行者持有
    Skipped,
    /// 运行级错误，运行已标记为失败
    Failed(String),
}

/// 运行处理统计
#[derive(Debug, Default, Clone, Copy)]
pub struct CellStats {
    pub completed: u32,
    pub failed: u32,
}

/// 合并 LLM 参数，后面的层覆盖前面的层
pub fn merge_parameters(layers: &[&Map<String, Value>]) -> Map<String, Value> {
    let mut merged = Map::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// 百分比进度，保留两位小数
pub fn progress_of(processed: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (100.0 * processed as f64 / total as f64 * 100.0).round() / 100.0
}

pub struct RunProcessor {
    store: Arc<dyn WorkStore>,
    state: Arc<BatchStateManager>,
    cell_flow: CellFlow,
    notifier: Notifier,
}

impl RunProcessor {
    pub fn new(state: Arc<BatchStateManager>, cell_flow: CellFlow, notifier: Notifier) -> Self {
        Self {
            store: state.coordinator().store().clone(),
            state,
            cell_flow,
            notifier,
        }
    }

    /// 处理单个运行
    ///
    /// # 参数
    /// - `batch`: 运行所属批次
    /// - `run`: 运行
    /// - `questions`: 数据集问题（有序）
    /// - `interrupt`: 批次的取消令牌
    ///
    /// # 返回
    /// 运行级错误会被转换为 `RunOutcome::Failed`，只有标记失败本身出错时才返回错误
    pub async fn process(
        &self,
        batch: &Batch,
        run: &Run,
        questions: &[Question],
        interrupt: &CancellationToken,
    ) -> AppResult<RunOutcome> {
        if run.status.is_terminal() {
            info!("[批次 {}] 运行 {} 已是 {}，跳过", batch.id, run.id, run.status);
            return Ok(RunOutcome::Skipped);
        }

        let Some(lease) = self.state.coordinator().try_lease_run(run.id).await? else {
            warn!("[批次 {}] 运行 {} 正在由其他执行者处理，跳过", batch.id, run.id);
            return Ok(RunOutcome::Skipped);
        };

        let result = self.walk(batch, run, questions, interrupt, lease.as_ref()).await;
        if let Err(e) = lease.release().await {
            warn!("[批次 {}] 释放运行 {} 的执行租约失败: {}", batch.id, run.id, e);
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = e.to_string();
                error!("[批次 {}] ❌ 运行 {} 处理失败: {}", batch.id, run.id, message);
                self.fail_run(run.id, &message).await?;
                Ok(RunOutcome::Failed(message))
            }
        }
    }

    async fn fail_run(&self, run_id: i64, message: &str) -> AppResult<()> {
        self.store
            .update_run(
                run_id,
                RunPatch::new()
                    .status(RunStatus::Failed)
                    .error(message)
                    .touch(Utc::now()),
            )
            .await?;
        self.notifier.status_change(run_id, RunStatus::Failed.as_str(), message);
        self.notifier.error(run_id, message, Some(RunStatus::Failed.as_str()));
        Ok(())
    }

    /// 单元之间的中断检查
    async fn should_stop(&self, batch_id: i64, run_id: i64, interrupt: &CancellationToken) -> AppResult<bool> {
        if interrupt.is_cancelled() || self.state.is_interrupted(batch_id).await? {
            return Ok(true);
        }
        let status = self
            .store
            .run_status(run_id)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;
        Ok(status.stops_generation())
    }

    async fn walk(
        &self,
        batch: &Batch,
        run: &Run,
        questions: &[Question],
        interrupt: &CancellationToken,
        lease: &dyn LockGuard,
    ) -> AppResult<RunOutcome> {
        let model: LlmModel = self
            .store
            .model(run.model_id)
            .await?
            .ok_or(StoreError::ModelNotFound(run.model_id))?;

        let question_count = questions.len() as u32;
        let total = question_count * batch.repeat_count;

        let started = self
            .store
            .update_run(
                run.id,
                RunPatch::new()
                    .expect_status(&[RunStatus::Pending, RunStatus::Resuming, RunStatus::GeneratingAnswers])
                    .status(RunStatus::GeneratingAnswers)
                    .start_pass(total)
                    .touch(Utc::now()),
            )
            .await?;
        if !started {
            info!("[批次 {}] 运行 {} 在开始前已被暂停", batch.id, run.id);
            return Ok(RunOutcome::Interrupted);
        }

        info!(
            "[批次 {}] 🚀 运行 {}（{}）开始，共 {} 个单元",
            batch.id, run.id, run.name, total
        );
        self.notifier.status_change(run.id, RunStatus::GeneratingAnswers.as_str(), "开始生成回答");
        self.notifier.run_message(
            run.id,
            EventKind::TaskStarted,
            json!({ "runId": run.id, "batchId": batch.id, "total": total }),
        );

        let parameters = merge_parameters(&[&model.model_parameters, &batch.global_parameters, &run.parameters]);
        let mut stats = CellStats::default();

        for repeat_index in 0..batch.repeat_count {
            for (question_index, question) in questions.iter().enumerate() {
                if self.should_stop(batch.id, run.id, interrupt).await? {
                    info!(
                        "[批次 {}] ⏸ 运行 {} 在处理 {}/{} 个单元后中断",
                        batch.id,
                        run.id,
                        stats.completed + stats.failed,
                        total
                    );
                    return Ok(RunOutcome::Interrupted);
                }

                let cell = WorkCell::new(run.id, question.id, repeat_index, question_index as u32, question_count);
                let ctx = CellCtx::new(batch.id, cell, question_index + 1, questions.len(), total);

                let outcome = self.cell_flow.run(&ctx, run, &model, question, &parameters).await?;
                let mut patch = RunPatch::new();
                match &outcome {
                    CellOutcome::Answered | CellOutcome::AlreadyAnswered => stats.completed += 1,
                    CellOutcome::Failed(_) => {
                        stats.failed += 1;
                        patch = patch.add_failed_question(question.id);
                    }
                }

                let progress = progress_of(stats.completed + stats.failed, total);
                let now = Utc::now();
                self.store
                    .update_run(
                        run.id,
                        patch
                            .counts(stats.completed, stats.failed)
                            .progress(progress)
                            .cursor(question.id, cell.grid_index)
                            .touch(now),
                    )
                    .await?;
                self.store.update_batch(batch.id, BatchPatch::new().touch(now)).await?;

                self.notifier.run_progress(
                    run.id,
                    progress,
                    &format!("已处理 {}/{}", stats.completed + stats.failed, total),
                );

                if !lease.extend(self.state.coordinator().run_lease()).await? {
                    warn!("[批次 {}] 运行 {} 的执行租约已失效，停止处理", batch.id, run.id);
                    return Ok(RunOutcome::Interrupted);
                }
                // 长时间运行的批次不能让缓存的状态与中断标志过期
                self.state.coordinator().refresh_cache_ttl(batch.id).await?;
            }
        }

        let finished = self
            .store
            .update_run(
                run.id,
                RunPatch::new()
                    .expect_status(&[RunStatus::GeneratingAnswers])
                    .status(RunStatus::Completed)
                    .progress(100.0)
                    .touch(Utc::now()),
            )
            .await?;
        if !finished {
            info!("[批次 {}] 运行 {} 走完网格时已被暂停，保持当前状态", batch.id, run.id);
            return Ok(RunOutcome::Interrupted);
        }

        info!(
            "[批次 {}] ✅ 运行 {} 完成: 成功 {}，失败 {}，共 {}",
            batch.id, run.id, stats.completed, stats.failed, total
        );
        self.notifier.status_change(run.id, RunStatus::Completed.as_str(), "运行完成");
        self.notifier.run_message(
            run.id,
            EventKind::TaskCompleted,
            json!({
                "runId": run.id,
                "completed": stats.completed,
                "failed": stats.failed,
                "total": total,
            }),
        );
        Ok(RunOutcome::Completed)
    }
}
