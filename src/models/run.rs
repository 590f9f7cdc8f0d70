use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::status::RunStatus;
use super::{BatchId, ModelId, QuestionId, RunId};

/// 模型回答运行：一个模型在一个批次内的执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub batch_id: BatchId,
    pub model_id: ModelId,
    pub name: String,
    pub status: RunStatus,
    /// 运行级别的 LLM 参数（优先级最高）
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// 问题数 × 重复次数
    pub total_questions_count: u32,
    pub completed_questions_count: u32,
    pub failed_questions_count: u32,
    pub failed_questions_ids: BTreeSet<QuestionId>,
    pub progress_percentage: f64,
    /// 仅用于观察，恢复时不会从这里继续
    pub last_processed_question_id: Option<QuestionId>,
    pub last_processed_question_index: Option<u32>,
    pub resume_count: u32,
    pub pause_time: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Run {
    /// 创建新的运行（PENDING）
    pub fn new(id: RunId, batch_id: BatchId, model_id: ModelId, name: impl Into<String>) -> Self {
        Self {
            id,
            batch_id,
            model_id,
            name: name.into(),
            status: RunStatus::Pending,
            parameters: Map::new(),
            total_questions_count: 0,
            completed_questions_count: 0,
            failed_questions_count: 0,
            failed_questions_ids: BTreeSet::new(),
            progress_percentage: 0.0,
            last_processed_question_id: None,
            last_processed_question_index: None,
            resume_count: 0,
            pause_time: None,
            pause_reason: None,
            last_activity_time: None,
            error_message: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// 已处理（成功 + 失败）的单元数
    pub fn processed_count(&self) -> u32 {
        self.completed_questions_count + self.failed_questions_count
    }
}

/// 运行的部分更新，语义同 [`super::BatchPatch`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub expected_status: Option<Vec<RunStatus>>,
    pub status: Option<RunStatus>,
    pub total_questions_count: Option<u32>,
    pub completed_questions_count: Option<u32>,
    pub failed_questions_count: Option<u32>,
    pub reset_failed_ids: bool,
    pub add_failed_id: Option<QuestionId>,
    pub progress_percentage: Option<f64>,
    pub cursor: Option<(QuestionId, u32)>,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub pause: Option<Option<(DateTime<Utc>, String)>>,
    pub bump_resume_count: bool,
    pub error_message: Option<Option<String>>,
}

impl RunPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_status(mut self, statuses: &[RunStatus]) -> Self {
        self.expected_status = Some(statuses.to_vec());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// 开始新一轮遍历：写入总数并清零计数器
    pub fn start_pass(mut self, total: u32) -> Self {
        self.total_questions_count = Some(total);
        self.completed_questions_count = Some(0);
        self.failed_questions_count = Some(0);
        self.reset_failed_ids = true;
        self.progress_percentage = Some(0.0);
        self
    }

    pub fn counts(mut self, completed: u32, failed: u32) -> Self {
        self.completed_questions_count = Some(completed);
        self.failed_questions_count = Some(failed);
        self
    }

    pub fn add_failed_question(mut self, question_id: QuestionId) -> Self {
        self.add_failed_id = Some(question_id);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress_percentage = Some(progress);
        self
    }

    pub fn cursor(mut self, question_id: QuestionId, index: u32) -> Self {
        self.cursor = Some((question_id, index));
        self
    }

    pub fn touch(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity_time = Some(at);
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

    pub fn matches(&self, run: &Run) -> bool {
        self.expected_status
            .as_ref()
            .map_or(true, |expected| expected.contains(&run.status))
    }

    pub fn apply(&self, run: &mut Run) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(total) = self.total_questions_count {
            run.total_questions_count = total;
        }
        if let Some(completed) = self.completed_questions_count {
            run.completed_questions_count = completed;
        }
        if let Some(failed) = self.failed_questions_count {
            run.failed_questions_count = failed;
        }
        if self.reset_failed_ids {
            run.failed_questions_ids.clear();
        }
        if let Some(question_id) = self.add_failed_id {
            run.failed_questions_ids.insert(question_id);
        }
        if let Some(progress) = self.progress_percentage {
            run.progress_percentage = progress;
        }
        if let Some((question_id, index)) = self.cursor {
            run.last_processed_question_id = Some(question_id);
            run.last_processed_question_index = Some(index);
        }
        if let Some(at) = self.last_activity_time {
            run.last_activity_time = Some(at);
        }
        match &self.pause {
            Some(Some((at, reason))) => {
                run.pause_time = Some(*at);
                run.pause_reason = Some(reason.clone());
            }
            Some(None) => {
                run.pause_time = None;
                run.pause_reason = None;
            }
            None => {}
        }
        if self.bump_resume_count {
            run.resume_count += 1;
        }
        if let Some(message) = &self.error_message {
            run.error_message = message.clone();
        }
    }
}
