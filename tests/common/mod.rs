#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use answer_batch_runner::clients::{GenerateRequest, LlmClient};
use answer_batch_runner::error::{AppError, AppResult};
use answer_batch_runner::models::{ApiType, BatchId, LlmModel, ModelId, Question, QuestionType};
use answer_batch_runner::orchestrator::{BatchPlan, BatchSnapshot, RunPlan};
use answer_batch_runner::{App, Config};

pub const DATASET_ID: i64 = 1;

/// 在第 `at_call` 次调用时停住，直到测试放行
#[derive(Clone)]
pub struct Gate {
    pub at_call: usize,
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl Gate {
    pub fn at(at_call: usize) -> Self {
        Self {
            at_call,
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

/// 按脚本返回结果的 LLM 客户端
#[derive(Default)]
pub struct FakeLlmClient {
    calls: AtomicUsize,
    failures: Mutex<HashSet<(String, String)>>,
    unreachable: Mutex<HashSet<String>>,
    gate: Mutex<Option<Gate>>,
}

impl FakeLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定模型回答指定问题时失败
    pub fn fail_on(self, model_name: &str, question_text: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((model_name.to_string(), question_text.to_string()));
        self
    }

    pub fn unreachable(self, model_name: &str) -> Self {
        self.unreachable.lock().unwrap().insert(model_name.to_string());
        self
    }

    pub fn with_gate(self, gate: Gate) -> Self {
        *self.gate.lock().unwrap() = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn generate(&self, request: GenerateRequest) -> AppResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let gate = {
            let mut slot = self.gate.lock().unwrap();
            match slot.as_ref() {
                Some(gate) if gate.at_call == call => slot.take(),
                _ => None,
            }
        };
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }

        let failing = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|(model, text)| *model == request.model_name && request.prompt.ends_with(text.as_str()));
        if failing {
            return Err(AppError::llm_api_failed(
                request.model_name,
                std::io::Error::new(std::io::ErrorKind::Other, "模拟的接口错误"),
            ));
        }

        Ok(format!("{} 的回答", request.model_name))
    }

    async fn test_connectivity(&self, model: &LlmModel) -> bool {
        !self.unreachable.lock().unwrap().contains(&model.name)
    }
}

pub fn test_config() -> Config {
    Config {
        check_model_connectivity: false,
        scheduler_interval_secs: 3600,
        lock_wait_ms: 500,
        ..Config::default()
    }
}

pub fn model_name(id: ModelId) -> String {
    format!("model-{}", id)
}

pub fn question_text(id: i64) -> String {
    format!("第{}题", id)
}

/// 组装应用，登记模型和一个包含 `question_count` 道题的数据集
pub fn app_with(config: Config, llm: Arc<FakeLlmClient>, models: &[ModelId], question_count: i64) -> App {
    let app = App::with_llm_client(config, llm);
    for &id in models {
        app.store()
            .insert_model(LlmModel {
                id,
                name: model_name(id),
                api_url: "http://localhost/v1".to_string(),
                api_key: String::new(),
                api_type: ApiType::OpenAiCompatible,
                model_parameters: Default::default(),
            })
            .unwrap();
    }
    let questions = (1..=question_count)
        .map(|id| Question::new(id, question_text(id), QuestionType::SimpleFact))
        .collect();
    app.store().insert_dataset(DATASET_ID, questions).unwrap();
    app
}

pub async fn create_batch(app: &App, models: &[ModelId], repeat_count: u32) -> BatchId {
    app.service()
        .create_batch(BatchPlan {
            name: "测试批次".to_string(),
            dataset_id: DATASET_ID,
            repeat_count,
            global_parameters: Default::default(),
            runs: models
                .iter()
                .map(|&id| RunPlan {
                    model_id: id,
                    name: model_name(id),
                    parameters: Default::default(),
                })
                .collect(),
        })
        .await
        .unwrap()
}

/// 轮询批次快照直到满足条件
pub async fn wait_for<F>(app: &App, batch_id: BatchId, mut done: F) -> BatchSnapshot
where
    F: FnMut(&BatchSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = app.service().snapshot(batch_id).await.unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("等待批次状态超时")
}

pub async fn wait_finished(app: &App, batch_id: BatchId) -> BatchSnapshot {
    wait_for(app, batch_id, |s| s.is_finished()).await
}

/// 等待本进程工作池中该批次的任务结束
pub async fn wait_idle(app: &App, batch_id: BatchId) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while app.scheduler().is_in_flight(batch_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("等待工作池空闲超时")
}
