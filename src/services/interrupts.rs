//! 进程内中断登记
//!
//! 每个批次一个取消令牌。暂停时取消令牌，恢复时换成新令牌，
//! 已经拿到旧令牌的生成任务仍会看到"已取消"。

use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::models::BatchId;

#[derive(Default)]
pub struct InterruptRegistry {
    tokens: Mutex<HashMap<BatchId, CancellationToken>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 批次当前的取消令牌
    pub fn token(&self, batch_id: BatchId) -> CancellationToken {
        match self.tokens.lock() {
            Ok(mut tokens) => tokens.entry(batch_id).or_default().clone(),
            // 锁中毒时退化为一个永不取消的令牌，由缓存标志兜底
            Err(_) => CancellationToken::new(),
        }
    }

    pub fn cancel(&self, batch_id: BatchId) {
        self.token(batch_id).cancel();
    }

    /// 清除中断标记，之后获取的令牌都是新的
    pub fn clear(&self, batch_id: BatchId) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(&batch_id);
        }
    }

    /// 只查询不登记，没有令牌的批次视为未取消
    pub fn is_cancelled(&self, batch_id: BatchId) -> bool {
        self.tokens
            .lock()
            .map(|tokens| tokens.get(&batch_id).is_some_and(CancellationToken::is_cancelled))
            .unwrap_or(false)
    }

    /// 已登记令牌的批次数
    pub fn len(&self) -> usize {
        self.tokens.lock().map(|tokens| tokens.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
