//! 批次服务 - 编排层
//!
//! 面向操作者的入口：创建、启动、暂停、恢复批次，以及查询批次快照。
//! 启动和恢复都通过恢复调度器的工作池派发，不直接调用生成引擎。

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{error, info};

use crate::clients::LlmClient;
use crate::error::{AppResult, LlmError, StoreError};
use crate::infrastructure::WorkStore;
use crate::models::{Batch, BatchId, BatchStatus, DatasetId, EventKind, ModelId, Run};
use crate::orchestrator::scheduler::RecoveryScheduler;
use crate::services::{BatchStateManager, Notifier, ResumeCallback};

/// 运行计划
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub model_id: ModelId,
    pub name: String,
    pub parameters: Map<String, Value>,
}

/// 批次计划
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub name: String,
    pub dataset_id: DatasetId,
    pub repeat_count: u32,
    pub global_parameters: Map<String, Value>,
    pub runs: Vec<RunPlan>,
}

/// 批次快照，状态取缓存优先的值
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub batch: Batch,
    pub runs: Vec<Run>,
}

impl BatchSnapshot {
    pub fn is_finished(&self) -> bool {
        matches!(self.batch.status, BatchStatus::Completed | BatchStatus::Failed)
    }
}

pub struct BatchService {
    store: Arc<dyn WorkStore>,
    state: Arc<BatchStateManager>,
    scheduler: Arc<RecoveryScheduler>,
    llm: Arc<dyn LlmClient>,
    notifier: Notifier,
    check_connectivity: bool,
}

impl BatchService {
    pub fn new(
        state: Arc<BatchStateManager>,
        scheduler: Arc<RecoveryScheduler>,
        llm: Arc<dyn LlmClient>,
        notifier: Notifier,
        check_connectivity: bool,
    ) -> Self {
        Self {
            store: state.coordinator().store().clone(),
            state,
            scheduler,
            llm,
            notifier,
            check_connectivity,
        }
    }

    pub fn state(&self) -> &Arc<BatchStateManager> {
        &self.state
    }

    /// 创建批次：一个 PENDING 批次加上每个模型一个 PENDING 运行
    pub async fn create_batch(&self, plan: BatchPlan) -> AppResult<BatchId> {
        let batch_id = self.store.allocate_batch_id().await?;
        if plan.runs.is_empty() {
            return Err(StoreError::NoRuns(batch_id).into());
        }
        if self.store.dataset_questions(plan.dataset_id).await?.is_empty() {
            return Err(StoreError::EmptyDataset(plan.dataset_id).into());
        }
        for run in &plan.runs {
            if self.store.model(run.model_id).await?.is_none() {
                return Err(StoreError::ModelNotFound(run.model_id).into());
            }
        }

        let batch = Batch::new(batch_id, plan.name.clone(), plan.dataset_id, plan.repeat_count)
            .with_global_parameters(plan.global_parameters);
        self.store.insert_batch(batch).await?;
        for run in plan.runs {
            let run_id = self.store.allocate_run_id().await?;
            self.store
                .insert_run(Run::new(run_id, batch_id, run.model_id, run.name).with_parameters(run.parameters))
                .await?;
        }

        info!("[批次 {}] 📋 已创建批次 {}", batch_id, plan.name);
        self.notifier.global_message(
            EventKind::StatusChange,
            json!({ "batchId": batch_id, "status": BatchStatus::Pending.as_str() }),
        );
        Ok(batch_id)
    }

    /// 测试批次所有运行的模型连通性
    ///
    /// # 返回
    /// 有模型连接失败时返回 [`LlmError::Connectivity`]，包含失败的模型名称
    pub async fn check_connectivity(&self, batch_id: BatchId) -> AppResult<()> {
        let runs = self.store.runs_for_batch(batch_id).await?;
        if runs.is_empty() {
            return Err(StoreError::NoRuns(batch_id).into());
        }

        info!("[批次 {}] 开始测试 {} 个模型的连通性", batch_id, runs.len());
        let mut models = Vec::with_capacity(runs.len());
        for run in &runs {
            let model = self
                .store
                .model(run.model_id)
                .await?
                .ok_or(StoreError::ModelNotFound(run.model_id))?;
            models.push(model);
        }

        let results = join_all(models.iter().map(|m| self.llm.test_connectivity(m))).await;
        let failed: Vec<String> = models
            .iter()
            .zip(results)
            .filter(|(_, ok)| !ok)
            .map(|(m, _)| format!("{} ({})", m.name, m.api_type))
            .collect();

        if failed.is_empty() {
            info!("[批次 {}] 所有模型连通性测试通过", batch_id);
            Ok(())
        } else {
            Err(LlmError::Connectivity { models: failed }.into())
        }
    }

    /// 连通性测试失败时把批次标记为失败并返回原错误
    async fn ensure_connectivity(&self, batch_id: BatchId) -> AppResult<()> {
        if !self.check_connectivity {
            return Ok(());
        }
        if let Err(e) = self.check_connectivity(batch_id).await {
            let message = e.to_string();
            error!("[批次 {}] 模型连通性测试失败: {}", batch_id, message);
            self.state.fail_batch(batch_id, &message).await?;
            return Err(e);
        }
        Ok(())
    }

    /// 启动批次：PENDING → IN_PROGRESS，然后提交到工作池
    pub async fn start_batch(&self, batch_id: BatchId) -> AppResult<()> {
        self.ensure_connectivity(batch_id).await?;
        self.state
            .transition(batch_id, BatchStatus::InProgress, None)
            .await?;
        self.scheduler.submit(batch_id, true).await?;
        info!("[批次 {}] ▶ 已启动", batch_id);
        Ok(())
    }

    pub async fn pause_batch(&self, batch_id: BatchId, reason: &str) -> AppResult<()> {
        self.state.pause(batch_id, reason).await
    }

    /// 恢复批次：状态写入后、释放锁之前把批次提交到工作池
    pub async fn resume_batch(&self, batch_id: BatchId) -> AppResult<()> {
        self.ensure_connectivity(batch_id).await?;

        let scheduler = self.scheduler.clone();
        let dispatch: ResumeCallback = Box::new(move || {
            async move {
                if let Err(e) = scheduler.submit(batch_id, true).await {
                    error!("[批次 {}] 恢复后提交失败: {}", batch_id, e);
                }
            }
            .boxed()
        });
        self.state.resume(batch_id, Some(dispatch)).await
    }

    /// 批次快照
    pub async fn snapshot(&self, batch_id: BatchId) -> AppResult<BatchSnapshot> {
        let mut batch = self
            .store
            .batch(batch_id)
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        if let Some(status) = self.state.status(batch_id).await? {
            batch.status = status;
        }
        let runs = self.store.runs_for_batch(batch_id).await?;
        Ok(BatchSnapshot { batch, runs })
    }
}
