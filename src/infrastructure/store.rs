//! 工作存储 - 基础设施层
//!
//! 持久化批次、运行和回答，是状态的唯一可信来源。
//! 所有更新都以"部分更新"的方式提交，避免并发写入互相覆盖。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{AppResult, StoreError};
use crate::models::{
    Answer, AnswerInsert, Batch, BatchId, BatchPatch, BatchStatus, DatasetId, LlmModel, ModelId,
    Question, QuestionId, Run, RunId, RunPatch, RunStatus,
};

/// 工作存储
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// 分配新的批次ID
    async fn allocate_batch_id(&self) -> AppResult<BatchId>;

    /// 分配新的运行ID
    async fn allocate_run_id(&self) -> AppResult<RunId>;

    async fn insert_batch(&self, batch: Batch) -> AppResult<()>;

    async fn batch(&self, id: BatchId) -> AppResult<Option<Batch>>;

    async fn batch_status(&self, id: BatchId) -> AppResult<Option<BatchStatus>>;

    /// 按状态查询批次，按最近活动时间倒序
    async fn batches_by_status(&self, statuses: &[BatchStatus]) -> AppResult<Vec<Batch>>;

    /// 部分更新批次；返回是否写入（比较条件不满足时为 false）
    async fn update_batch(&self, id: BatchId, patch: BatchPatch) -> AppResult<bool>;

    async fn insert_run(&self, run: Run) -> AppResult<()>;

    async fn run(&self, id: RunId) -> AppResult<Option<Run>>;

    async fn run_status(&self, id: RunId) -> AppResult<Option<RunStatus>>;

    async fn runs_for_batch(&self, batch_id: BatchId) -> AppResult<Vec<Run>>;

    async fn update_run(&self, id: RunId, patch: RunPatch) -> AppResult<bool>;

    /// 对批次下满足比较条件的所有运行执行同一更新，返回写入条数
    async fn update_runs_for_batch(&self, batch_id: BatchId, patch: RunPatch) -> AppResult<usize>;

    async fn model(&self, id: ModelId) -> AppResult<Option<LlmModel>>;

    /// 数据集中的问题，按数据集顺序返回
    async fn dataset_questions(&self, dataset_id: DatasetId) -> AppResult<Vec<Question>>;

    /// 写入回答；同一 (运行, 问题, 重复序号) 已有回答时返回 Duplicate
    async fn insert_answer(&self, answer: Answer) -> AppResult<AnswerInsert>;

    async fn has_answer(&self, run_id: RunId, question_id: QuestionId, repeat_index: u32) -> AppResult<bool>;

    async fn answers_for_run(&self, run_id: RunId) -> AppResult<Vec<Answer>>;
}

#[derive(Default)]
struct Tables {
    batches: BTreeMap<BatchId, Batch>,
    runs: BTreeMap<RunId, Run>,
    answers: BTreeMap<(RunId, QuestionId, u32), Answer>,
    models: HashMap<ModelId, LlmModel>,
    datasets: HashMap<DatasetId, Vec<Question>>,
    last_batch_id: BatchId,
    last_run_id: RunId,
}

/// 内存版工作存储
///
/// 单个互斥锁保护所有表，每次调用相当于一个短事务
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> AppResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("内存存储锁已中毒".to_string()).into())
    }

    /// 注册模型
    pub fn insert_model(&self, model: LlmModel) -> AppResult<()> {
        self.tables()?.models.insert(model.id, model);
        Ok(())
    }

    /// 写入数据集问题（覆盖原有内容）
    pub fn insert_dataset(&self, dataset_id: DatasetId, questions: Vec<Question>) -> AppResult<()> {
        self.tables()?.datasets.insert(dataset_id, questions);
        Ok(())
    }
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn allocate_batch_id(&self) -> AppResult<BatchId> {
        let mut tables = self.tables()?;
        let next = tables
            .last_batch_id
            .max(tables.batches.keys().next_back().copied().unwrap_or(0))
            + 1;
        tables.last_batch_id = next;
        Ok(next)
    }

    async fn allocate_run_id(&self) -> AppResult<RunId> {
        let mut tables = self.tables()?;
        let next = tables
            .last_run_id
            .max(tables.runs.keys().next_back().copied().unwrap_or(0))
            + 1;
        tables.last_run_id = next;
        Ok(next)
    }

    async fn insert_batch(&self, batch: Batch) -> AppResult<()> {
        self.tables()?.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn batch(&self, id: BatchId) -> AppResult<Option<Batch>> {
        Ok(self.tables()?.batches.get(&id).cloned())
    }

    async fn batch_status(&self, id: BatchId) -> AppResult<Option<BatchStatus>> {
        Ok(self.tables()?.batches.get(&id).map(|b| b.status))
    }

    async fn batches_by_status(&self, statuses: &[BatchStatus]) -> AppResult<Vec<Batch>> {
        let mut batches: Vec<Batch> = self
            .tables()?
            .batches
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.last_activity_time.cmp(&a.last_activity_time));
        Ok(batches)
    }

    async fn update_batch(&self, id: BatchId, patch: BatchPatch) -> AppResult<bool> {
        let mut tables = self.tables()?;
        let batch = tables
            .batches
            .get_mut(&id)
            .ok_or(StoreError::BatchNotFound(id))?;
        if !patch.matches(batch) {
            return Ok(false);
        }
        patch.apply(batch);
        Ok(true)
    }

    async fn insert_run(&self, run: Run) -> AppResult<()> {
        self.tables()?.runs.insert(run.id, run);
        Ok(())
    }

    async fn run(&self, id: RunId) -> AppResult<Option<Run>> {
        Ok(self.tables()?.runs.get(&id).cloned())
    }

    async fn run_status(&self, id: RunId) -> AppResult<Option<RunStatus>> {
        Ok(self.tables()?.runs.get(&id).map(|r| r.status))
    }

    async fn runs_for_batch(&self, batch_id: BatchId) -> AppResult<Vec<Run>> {
        Ok(self
            .tables()?
            .runs
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn update_run(&self, id: RunId, patch: RunPatch) -> AppResult<bool> {
        let mut tables = self.tables()?;
        let run = tables.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        if !patch.matches(run) {
            return Ok(false);
        }
        patch.apply(run);
        Ok(true)
    }

    async fn update_runs_for_batch(&self, batch_id: BatchId, patch: RunPatch) -> AppResult<usize> {
        let mut tables = self.tables()?;
        let mut updated = 0;
        for run in tables.runs.values_mut().filter(|r| r.batch_id == batch_id) {
            if patch.matches(run) {
                patch.apply(run);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn model(&self, id: ModelId) -> AppResult<Option<LlmModel>> {
        Ok(self.tables()?.models.get(&id).cloned())
    }

    async fn dataset_questions(&self, dataset_id: DatasetId) -> AppResult<Vec<Question>> {
        Ok(self
            .tables()?
            .datasets
            .get(&dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_answer(&self, answer: Answer) -> AppResult<AnswerInsert> {
        let mut tables = self.tables()?;
        let key = answer.key();
        if tables.answers.contains_key(&key) {
            return Ok(AnswerInsert::Duplicate);
        }
        tables.answers.insert(key, answer);
        Ok(AnswerInsert::Inserted)
    }

    async fn has_answer(&self, run_id: RunId, question_id: QuestionId, repeat_index: u32) -> AppResult<bool> {
        Ok(self
            .tables()?
            .answers
            .contains_key(&(run_id, question_id, repeat_index)))
    }

    async fn answers_for_run(&self, run_id: RunId) -> AppResult<Vec<Answer>> {
        Ok(self
            .tables()?
            .answers
            .range((run_id, QuestionId::MIN, 0)..=(run_id, QuestionId::MAX, u32::MAX))
            .map(|(_, answer)| answer.clone())
            .collect())
    }
}
