use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::{QuestionId, RunId};

/// 工作单元：(运行, 问题, 重复序号)
///
/// 不单独持久化，只在遍历网格时按顺序生成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkCell {
    pub run_id: RunId,
    pub question_id: QuestionId,
    pub repeat_index: u32,
    /// 在整个网格中的位置（重复序号在外层，数据集顺序在内层）
    pub grid_index: u32,
}

impl WorkCell {
    /// 计算单元在网格中的位置
    pub fn new(run_id: RunId, question_id: QuestionId, repeat_index: u32, question_index: u32, question_count: u32) -> Self {
        Self {
            run_id,
            question_id,
            repeat_index,
            grid_index: repeat_index * question_count + question_index,
        }
    }
}

impl Display for WorkCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[运行 #{} 问题 #{} 重复 #{}]",
            self.run_id, self.question_id, self.repeat_index
        )
    }
}

/// 模型生成的回答，写入后不可修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub run_id: RunId,
    pub question_id: QuestionId,
    pub repeat_index: u32,
    pub answer_text: String,
    pub prompt_used: String,
    pub generation_time: DateTime<Utc>,
}

impl Answer {
    pub fn for_cell(cell: &WorkCell, answer_text: String, prompt_used: String) -> Self {
        Self {
            run_id: cell.run_id,
            question_id: cell.question_id,
            repeat_index: cell.repeat_index,
            answer_text,
            prompt_used,
            generation_time: Utc::now(),
        }
    }

    /// 唯一键：同一单元只保留一个回答
    pub fn key(&self) -> (RunId, QuestionId, u32) {
        (self.run_id, self.question_id, self.repeat_index)
    }
}

/// 回答写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerInsert {
    Inserted,
    /// 该单元已有回答，未重复写入
    Duplicate,
}
