//! 推送事件
//!
//! 事件按主题分发：批次、运行、状态、进度、错误以及全局主题

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 事件主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Batch(i64),
    Run(i64),
    Status(i64),
    RunProgress(i64),
    Error(i64),
    /// 全局错误频道
    Errors,
    Global,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Batch(id) => write!(f, "/topic/batch/{}", id),
            Topic::Run(id) => write!(f, "/topic/run/{}", id),
            Topic::Status(id) => write!(f, "/topic/status/{}", id),
            Topic::RunProgress(id) => write!(f, "/topic/progress/run/{}", id),
            Topic::Error(id) => write!(f, "/topic/error/{}", id),
            Topic::Errors => f.write_str("/topic/errors"),
            Topic::Global => f.write_str("/topic/global"),
        }
    }
}

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StatusChange,
    ProgressUpdate,
    TaskStarted,
    TaskCompleted,
    QuestionStarted,
    QuestionCompleted,
    QuestionFailed,
    Error,
}

/// 推送事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}
