//! 批量回答处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责组装各层组件并驱动批次执行。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：创建存储、缓存、锁、事件通道和 LLM 客户端
//! 2. **批量加载**：扫描数据集目录，为每个数据集创建一个批次
//! 3. **并发控制**：批次通过恢复调度器的有界工作池执行
//! 4. **等待结束**：直到没有批次处于执行状态
//! 5. **全局统计**：汇总所有批次的处理结果
//! 6. **优雅退出**：暂停仍在执行的批次并排空工作池

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::clients::{HttpLlmClient, LlmClient};
use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::{BroadcastEventSink, MemoryCache, MemoryLockService, MemoryStore};
use crate::models::{
    load_all_dataset_files, ApiType, BatchId, BatchStatus, DatasetFile, Event, LlmModel, ModelId, Topic,
};
use crate::orchestrator::batch_service::{BatchPlan, BatchService, BatchSnapshot, RunPlan};
use crate::orchestrator::generation_engine::GenerationEngine;
use crate::orchestrator::scheduler::RecoveryScheduler;
use crate::services::{BatchCoordinator, BatchPromptRegistry, BatchStateManager, InterruptRegistry, Notifier};
use crate::utils::logging;

/// 数据集未声明模型时使用的默认模型ID
pub const DEFAULT_MODEL_ID: ModelId = 0;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 应用主结构
pub struct App {
    config: Config,
    store: Arc<MemoryStore>,
    events: Arc<BroadcastEventSink>,
    prompts: Arc<BatchPromptRegistry>,
    scheduler: Arc<RecoveryScheduler>,
    service: BatchService,
    batches: Mutex<Vec<BatchId>>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> AppResult<Self> {
        logging::log_startup(&config);
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(&config)?);
        Ok(Self::with_llm_client(config, llm))
    }

    /// 使用指定的 LLM 客户端组装应用，并启动恢复调度器
    pub fn with_llm_client(config: Config, llm: Arc<dyn LlmClient>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(BroadcastEventSink::default());
        let notifier = Notifier::new(events.clone());

        let coordinator = Arc::new(BatchCoordinator::new(
            &config,
            Arc::new(MemoryLockService::new()),
            Arc::new(MemoryCache::new()),
            store.clone(),
        ));
        let state = Arc::new(BatchStateManager::new(
            coordinator,
            Arc::new(InterruptRegistry::new()),
            notifier.clone(),
        ));

        let prompts = Arc::new(BatchPromptRegistry::new());
        let engine = Arc::new(GenerationEngine::new(
            &config,
            state.clone(),
            llm.clone(),
            prompts.clone(),
            notifier.clone(),
        ));
        let scheduler = Arc::new(RecoveryScheduler::new(&config, state.clone(), engine));
        scheduler.start();

        let service = BatchService::new(
            state,
            scheduler.clone(),
            llm,
            notifier,
            config.check_model_connectivity,
        );

        Self {
            config,
            store,
            events,
            prompts,
            scheduler,
            service,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &BatchService {
        &self.service
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<RecoveryScheduler> {
        &self.scheduler
    }

    /// 订阅推送事件
    pub fn subscribe(&self) -> broadcast::Receiver<(Topic, Event)> {
        self.events.subscribe()
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> AppResult<()> {
        info!("\n📁 正在扫描数据集目录 {} ...", self.config.dataset_folder);
        let datasets = load_all_dataset_files(&self.config.dataset_folder).await?;

        if datasets.is_empty() {
            warn!("⚠️ 没有找到数据集TOML文件，程序结束");
            return Ok(());
        }

        let mut total_runs = 0;
        for dataset in datasets {
            let label = dataset.file_path.clone().unwrap_or_else(|| dataset.name.clone());
            match self.launch_dataset(dataset).await {
                Ok((batch_id, runs)) => {
                    total_runs += runs;
                    self.track(batch_id);
                }
                Err(e) => error!("❌ 数据集 {} 启动失败: {}", label, e),
            }
        }

        let batch_ids = self.tracked();
        logging::log_datasets_loaded(batch_ids.len(), total_runs);

        let snapshots = self.wait_until_settled(&batch_ids).await?;
        let completed = snapshots
            .iter()
            .filter(|s| s.batch.status == BatchStatus::Completed)
            .count();
        let failed = snapshots
            .iter()
            .filter(|s| s.batch.status == BatchStatus::Failed)
            .count();
        logging::print_final_stats(completed, failed, snapshots.len() - completed - failed);

        self.scheduler.stop().await;
        Ok(())
    }

    /// 登记数据集内容，创建批次并启动
    ///
    /// # 返回
    /// 返回批次ID和运行数量
    pub async fn launch_dataset(&self, dataset: DatasetFile) -> AppResult<(BatchId, usize)> {
        let mut models = dataset.models;
        if models.is_empty() {
            info!("数据集 {} 未声明模型，使用默认模型 {}", dataset.name, self.config.llm_model_name);
            models.push(self.default_model());
        }
        for model in &models {
            self.store.insert_model(model.clone())?;
        }
        self.store.insert_dataset(dataset.dataset_id, dataset.questions)?;

        let runs: Vec<RunPlan> = models
            .iter()
            .map(|m| RunPlan {
                model_id: m.id,
                name: format!("{} - {}", dataset.name, m.name),
                parameters: Default::default(),
            })
            .collect();
        let run_count = runs.len();

        let batch_id = self
            .service
            .create_batch(BatchPlan {
                name: dataset.name,
                dataset_id: dataset.dataset_id,
                repeat_count: dataset.repeat_count,
                global_parameters: dataset.global_parameters,
                runs,
            })
            .await?;
        self.prompts.register(batch_id, dataset.prompt);
        self.service.start_batch(batch_id).await?;
        Ok((batch_id, run_count))
    }

    fn default_model(&self) -> LlmModel {
        LlmModel {
            id: DEFAULT_MODEL_ID,
            name: self.config.llm_model_name.clone(),
            api_url: self.config.llm_api_base_url.clone(),
            api_key: self.config.llm_api_key.clone(),
            api_type: ApiType::OpenAiCompatible,
            model_parameters: Default::default(),
        }
    }

    fn track(&self, batch_id: BatchId) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(batch_id);
        }
    }

    fn tracked(&self) -> Vec<BatchId> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// 等待所有批次离开执行状态
    async fn wait_until_settled(&self, batch_ids: &[BatchId]) -> AppResult<Vec<BatchSnapshot>> {
        loop {
            let mut snapshots = Vec::with_capacity(batch_ids.len());
            for &batch_id in batch_ids {
                snapshots.push(self.service.snapshot(batch_id).await?);
            }
            if snapshots.iter().all(|s| !s.batch.status.expects_active_task()) {
                return Ok(snapshots);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// 优雅退出：暂停仍在执行的批次，然后停止调度器
    pub async fn shutdown(&self) {
        info!("🛑 正在退出，暂停执行中的批次...");
        for batch_id in self.tracked() {
            let active = match self.service.snapshot(batch_id).await {
                Ok(snapshot) => snapshot.batch.status.expects_active_task(),
                Err(_) => false,
            };
            if active {
                if let Err(e) = self.service.pause_batch(batch_id, "进程退出").await {
                    warn!("[批次 {}] 退出时暂停失败: {}", batch_id, e);
                }
            }
        }
        self.scheduler.stop().await;
    }
}
