//! 批次与运行的状态定义
//!
//! 批次状态转换表是整个状态机的唯一依据：
//!
//! ```text
//! PENDING     -> {IN_PROGRESS, PAUSED, FAILED}
//! IN_PROGRESS -> {PAUSED, COMPLETED, FAILED}
//! PAUSED      -> {RESUMING, FAILED}
//! RESUMING    -> {IN_PROGRESS, PAUSED, FAILED}
//! COMPLETED   -> {FAILED}
//! FAILED      -> {}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StateError;

/// 批次状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Paused,
    Resuming,
    Completed,
    Failed,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 6] = [
        BatchStatus::Pending,
        BatchStatus::InProgress,
        BatchStatus::Paused,
        BatchStatus::Resuming,
        BatchStatus::Completed,
        BatchStatus::Failed,
    ];

    /// 当前状态允许转换到的目标状态
    pub fn allowed_transitions(self) -> &'static [BatchStatus] {
        use BatchStatus::*;
        match self {
            Pending => &[InProgress, Paused, Failed],
            InProgress => &[Paused, Completed, Failed],
            Paused => &[Resuming, Failed],
            Resuming => &[InProgress, Paused, Failed],
            Completed => &[Failed],
            Failed => &[],
        }
    }

    pub fn can_transition_to(self, target: BatchStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// 处于该状态的批次应当有生成任务在执行
    pub fn expects_active_task(self) -> bool {
        matches!(self, BatchStatus::InProgress | BatchStatus::Resuming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Paused => "PAUSED",
            BatchStatus::Resuming => "RESUMING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| StateError::UnknownStatus(s.to_string()))
    }
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    GeneratingAnswers,
    Paused,
    Resuming,
    Completed,
    Failed,
}

impl RunStatus {
    /// 暂停批次时需要一并暂停的运行状态
    pub const PAUSABLE: [RunStatus; 3] = [
        RunStatus::GeneratingAnswers,
        RunStatus::Resuming,
        RunStatus::Pending,
    ];

    /// 本轮处理已结束（完成或失败）
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// 生成循环遇到这些状态时必须立即停止
    pub fn stops_generation(self) -> bool {
        matches!(self, RunStatus::Paused | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::GeneratingAnswers => "GENERATING_ANSWERS",
            RunStatus::Paused => "PAUSED",
            RunStatus::Resuming => "RESUMING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
