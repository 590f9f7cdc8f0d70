//! 单元处理上下文
//!
//! 封装"我正在处理哪个批次、哪个运行的第几个单元"这一信息

use std::fmt::Display;

use crate::models::{BatchId, WorkCell};

/// 单元处理上下文
#[derive(Debug, Clone)]
pub struct CellCtx {
    pub batch_id: BatchId,

    pub cell: WorkCell,

    /// 问题在数据集中的序号（从1开始，仅用于日志显示）
    pub question_number: usize,

    pub question_count: usize,

    /// 本轮运行的单元总数
    pub total_cells: u32,
}

impl CellCtx {
    pub fn new(batch_id: BatchId, cell: WorkCell, question_number: usize, question_count: usize, total_cells: u32) -> Self {
        Self {
            batch_id,
            cell,
            question_number,
            question_count,
            total_cells,
        }
    }
}

impl Display for CellCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[批次 {} 运行 {} 问题 {}/{} 重复 #{}]",
            self.batch_id,
            self.cell.run_id,
            self.question_number,
            self.question_count,
            self.cell.repeat_index
        )
    }
}
