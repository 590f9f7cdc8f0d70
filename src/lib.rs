//! # Answer Batch Runner
//!
//! 一个把问题数据集批量发送给多个 LLM 并收集回答的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有共享资源，只暴露能力
//! - `WorkStore` - 批次、运行、问题和回答的持久化
//! - `StateCache` / `LockService` - 跨进程的状态缓存和互斥锁
//! - `EventSink` - 按主题推送事件
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `BatchStateManager` - 批次状态机（暂停、恢复、对账）
//! - `PromptAssembler` - 提示词组装
//! - `Notifier` - 事件推送
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个单元"的完整处理流程
//! - `CellCtx` - 上下文封装（批次 + 运行 + 问题 + 重复序号）
//! - `CellFlow` - 流程编排（提示词 → LLM → 保存回答 → 事件）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/generation_engine` - 批次生成引擎，并发处理所有运行
//! - `orchestrator/run_processor` - 单个运行处理器，遍历单元列表
//! - `orchestrator/scheduler` - 恢复调度器，重新提交孤儿批次
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{Batch, BatchStatus, Question, Run, RunStatus};
pub use orchestrator::{App, BatchService, GenerationEngine, RecoveryScheduler};
pub use services::BatchStateManager;
pub use workflow::{CellCtx, CellFlow, CellOutcome};
