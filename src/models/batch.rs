use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::status::BatchStatus;
use super::{BatchId, DatasetId};

/// 回答生成批次
///
/// 一个批次对应"一份数据集 × 多个模型 × 重复次数"的完整生成任务。
/// 批次只记录运行的归属关系，运行需要通过存储显式查询。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub dataset_id: DatasetId,
    pub status: BatchStatus,
    /// 由运行进度推导，不单独设置
    pub progress_percentage: f64,
    /// 每个问题在每个运行中需要回答的次数
    pub repeat_count: u32,
    /// 批次级别的全局 LLM 参数
    #[serde(default)]
    pub global_parameters: Map<String, Value>,
    pub last_activity_time: Option<DateTime<Utc>>,
    /// 恢复调度器确认批次健康时写入，用于防抖
    pub last_check_time: Option<DateTime<Utc>>,
    pub resume_count: u32,
    pub pause_time: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// 创建新的批次（PENDING）
    pub fn new(id: BatchId, name: impl Into<String>, dataset_id: DatasetId, repeat_count: u32) -> Self {
        Self {
            id,
            name: name.into(),
            dataset_id,
            status: BatchStatus::Pending,
            progress_percentage: 0.0,
            repeat_count: repeat_count.max(1),
            global_parameters: Map::new(),
            last_activity_time: None,
            last_check_time: None,
            resume_count: 0,
            pause_time: None,
            pause_reason: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_global_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.global_parameters = parameters;
        self
    }
}

/// 批次的部分更新
///
/// 只写入显式设置的字段，对应一条 `UPDATE ... SET` 语句。
/// `expected_status` 非空时按比较并交换的方式执行：当前状态不在列表中则不写入。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPatch {
    pub expected_status: Option<Vec<BatchStatus>>,
    pub status: Option<BatchStatus>,
    pub progress_percentage: Option<f64>,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub last_check_time: Option<DateTime<Utc>>,
    pub pause: Option<Option<(DateTime<Utc>, String)>>,
    pub bump_resume_count: bool,
    pub error_message: Option<Option<String>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_status(mut self, statuses: &[BatchStatus]) -> Self {
        self.expected_status = Some(statuses.to_vec());
        self
    }

    pub fn status(mut self, status: BatchStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress_percentage = Some(progress);
        self
    }

    pub fn touch(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity_time = Some(at);
        self
    }

    pub fn checked(mut self, at: DateTime<Utc>) -> Self {
        self.last_check_time = Some(at);
        self
    }

    pub fn paused(mut self, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        self.pause = Some(Some((at, reason.into())));
        self
    }

    pub fn clear_pause(mut self) -> Self {
        self.pause = Some(None);
        self
    }

    pub fn bump_resume_count(mut self) -> Self {
        self.bump_resume_count = true;
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// 检查比较条件是否满足
    pub fn matches(&self, batch: &Batch) -> bool {
        self.expected_status
            .as_ref()
            .map_or(true, |expected| expected.contains(&batch.status))
    }

    /// 将更新应用到批次上（不检查比较条件）
    pub fn apply(&self, batch: &mut Batch) {
        if let Some(status) = self.status {
            batch.status = status;
        }
        if let Some(progress) = self.progress_percentage {
            batch.progress_percentage = progress;
        }
        if let Some(at) = self.last_activity_time {
            batch.last_activity_time = Some(at);
        }
        if let Some(at) = self.last_check_time {
            batch.last_check_time = Some(at);
        }
        match &self.pause {
            Some(Some((at, reason))) => {
                batch.pause_time = Some(*at);
                batch.pause_reason = Some(reason.clone());
            }
            Some(None) => {
                batch.pause_time = None;
                batch.pause_reason = None;
            }
            None => {}
        }
        if self.bump_resume_count {
            batch.resume_count += 1;
        }
        if let Some(message) = &self.error_message {
            batch.error_message = message.clone();
        }
        if let Some(at) = self.completed_at {
            batch.completed_at = Some(at);
        }
    }
}
