//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批次调度和执行，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 应用入口
//! - 管理应用生命周期（初始化、运行、退出）
//! - 扫描数据集并为每个数据集创建批次
//! - 输出全局统计信息
//!
//! ### `batch_service` - 批次操作
//! - 创建、启动、暂停、恢复批次
//! - 启动和恢复前测试模型连通性
//!
//! ### `scheduler` - 恢复调度器
//! - 定期巡检孤儿批次并重新提交
//! - 持有有界工作池（Semaphore + JoinSet）
//!
//! ### `generation_engine` - 回答生成引擎
//! - 推进批次状态，并发处理批次的所有运行
//! - 汇总批次进度和终态
//!
//! ### `run_processor` - 单个运行处理器
//! - 按"重复 × 问题"遍历单元，每个单元之前检查中断
//! - 记录运行计数、进度和最近处理位置
//!
//! ## 层次关系
//!
//! ```text
//! batch_service / scheduler (提交批次)
//!     ↓
//! generation_engine (处理 Vec<Run>)
//!     ↓
//! run_processor (处理 Vec<WorkCell>)
//!     ↓
//! workflow::CellFlow (处理单个单元)
//!     ↓
//! services (能力层：状态机 / 提示词 / 事件)
//!     ↓
//! infrastructure (基础设施：存储 / 缓存 / 锁 / 事件通道)
//! ```

pub mod batch_processor;
pub mod batch_service;
pub mod generation_engine;
pub mod run_processor;
pub mod scheduler;

// 重新导出主要类型
pub use batch_processor::App;
pub use batch_service::{BatchPlan, BatchService, BatchSnapshot, RunPlan};
pub use generation_engine::GenerationEngine;
pub use run_processor::{RunOutcome, RunProcessor};
pub use scheduler::{BatchExecutor, CheckReport, RecoveryScheduler};
