//! 事件通知 - 业务能力层
//!
//! 把批次和运行的变化整理成统一的事件格式，交给事件通道推送。
//! 推送失败不会影响调用方。

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::infrastructure::EventSink;
use crate::models::{BatchId, Event, EventKind, RunId, Topic};

#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn EventSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// 发送批次消息
    pub fn batch_message(&self, batch_id: BatchId, kind: EventKind, payload: Value) {
        self.sink.publish(Topic::Batch(batch_id), Event::new(kind, payload));
    }

    /// 发送运行消息
    pub fn run_message(&self, run_id: RunId, kind: EventKind, payload: Value) {
        self.sink.publish(Topic::Run(run_id), Event::new(kind, payload));
    }

    pub fn global_message(&self, kind: EventKind, payload: Value) {
        self.sink.publish(Topic::Global, Event::new(kind, payload));
    }

    /// 发送状态变更消息
    ///
    /// # 参数
    /// - `entity_id`: 批次ID或运行ID
    /// - `status`: 新状态
    /// - `message`: 说明文字
    pub fn status_change(&self, entity_id: i64, status: &str, message: &str) {
        self.sink.publish(
            Topic::Status(entity_id),
            Event::new(
                EventKind::StatusChange,
                json!({ "id": entity_id, "status": status, "message": message }),
            ),
        );
    }

    /// 发送运行进度消息
    pub fn run_progress(&self, run_id: RunId, progress: f64, message: &str) {
        self.sink.publish(
            Topic::RunProgress(run_id),
            Event::new(
                EventKind::ProgressUpdate,
                json!({ "runId": run_id, "progress": progress, "message": message }),
            ),
        );
    }

    /// 发送错误消息，同时推送到全局错误频道
    pub fn error(&self, entity_id: i64, error: &str, status: Option<&str>) {
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(entity_id));
        payload.insert("error".to_string(), json!(error));
        if let Some(status) = status {
            payload.insert("status".to_string(), json!(status));
        }
        let event = Event::new(EventKind::Error, Value::Object(payload));
        self.sink.publish(Topic::Error(entity_id), event.clone());
        self.sink.publish(Topic::Errors, event);
    }
}
