/// 日志工具模块
///
/// 提供日志格式化和输出的辅助函数
use tracing::info;

use crate::config::Config;
use crate::models::{BatchId, BatchStatus, Run};

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 应用配置
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 批量回答生成模式");
    info!("📊 工作池大小: {}", config.worker_pool_size);
    info!(
        "⏱ 调度间隔: {} 秒, 活动窗口: {} 秒",
        config.scheduler_interval_secs, config.activity_window_secs
    );
    info!("{}", "=".repeat(60));
}

/// 记录数据集加载信息
///
/// # 参数
/// - `datasets`: 数据集数量
/// - `runs`: 运行总数
pub fn log_datasets_loaded(datasets: usize, runs: usize) {
    info!("✓ 找到 {} 个数据集", datasets);
    info!("📋 共 {} 个模型运行待执行\n", runs);
}

/// 记录批次汇总信息
///
/// # 参数
/// - `batch_id`: 批次ID
/// - `runs`: 批次的所有运行
/// - `progress`: 批次进度
pub fn log_batch_summary(batch_id: BatchId, runs: &[Run], progress: f64) {
    info!("\n{}", "─".repeat(60));
    info!("[批次 {}] 📊 进度 {:.2}%", batch_id, progress);
    for run in runs {
        info!(
            "  - {} [{}]: 成功 {}, 失败 {}, 共 {}",
            run.name,
            run.status,
            run.completed_questions_count,
            run.failed_questions_count,
            run.total_questions_count
        );
    }
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `completed`: 完成的批次数
/// - `failed`: 失败的批次数
/// - `others`: 未结束（暂停等）的批次数
pub fn print_final_stats(completed: usize, failed: usize, others: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ {}: {}", BatchStatus::Completed, completed);
    info!("❌ {}: {}", BatchStatus::Failed, failed);
    if others > 0 {
        info!("⏸ 未结束: {}", others);
    }
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
