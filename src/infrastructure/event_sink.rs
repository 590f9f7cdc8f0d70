//! 事件推送 - 基础设施层
//!
//! 发布即忘：没有订阅者时事件直接丢弃，发布永远不会阻塞生成循环。

use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{Event, Topic};

/// 事件推送通道
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: Topic, event: Event);
}

/// 基于 tokio broadcast 的事件推送
#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<(Topic, Event)>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 订阅所有主题
    pub fn subscribe(&self) -> broadcast::Receiver<(Topic, Event)> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, topic: Topic, event: Event) {
        if self.tx.send((topic, event)).is_err() {
            debug!("主题 {} 暂无订阅者，事件已丢弃", topic);
        }
    }
}
