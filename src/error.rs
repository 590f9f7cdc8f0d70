use thiserror::Error;

use crate::models::{BatchId, BatchStatus, RunId};

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 状态机相关错误
    #[error("状态错误: {0}")]
    State(#[from] StateError),
    /// 存储读写错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// LLM 服务错误
    #[error("LLM错误: {0}")]
    Llm(#[from] LlmError),
    /// 调度器错误
    #[error("调度错误: {0}")]
    Scheduler(#[from] SchedulerError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 批次状态机错误
#[derive(Debug, Error)]
pub enum StateError {
    /// 状态转换不在允许表中
    #[error("批次 {batch_id} 不允许从 {from} 转换为 {to}")]
    InvalidTransition {
        batch_id: BatchId,
        from: BatchStatus,
        to: BatchStatus,
    },
    /// 分布式锁获取超时
    #[error("无法获取锁 {key}（等待 {waited_ms} 毫秒）")]
    LockTimeout { key: String, waited_ms: u128 },
    /// 写入后复核状态不一致
    #[error("批次 {batch_id} 写入后状态为 {actual:?}，期望 {expected}")]
    NotConfirmed {
        batch_id: BatchId,
        expected: BatchStatus,
        actual: Option<BatchStatus>,
    },
    /// 状态字符串无法解析
    #[error("无法解析状态值: {0}")]
    UnknownStatus(String),
}

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 批次不存在
    #[error("找不到指定的批次: {0}")]
    BatchNotFound(BatchId),
    /// 运行不存在
    #[error("运行不存在: {0}")]
    RunNotFound(RunId),
    /// 模型不存在
    #[error("找不到模型: {0}")]
    ModelNotFound(i64),
    /// 数据集没有问题
    #[error("数据集 {0} 没有问题")]
    EmptyDataset(i64),
    /// 批次没有关联的运行
    #[error("批次(ID: {0})没有关联的运行")]
    NoRuns(BatchId),
    /// 后端不可用
    #[error("存储后端不可用: {0}")]
    Unavailable(String),
}

/// LLM 服务错误
#[derive(Debug, Error)]
pub enum LlmError {
    /// API 调用失败
    #[error("LLM API调用失败 (模型: {model}): {source}")]
    ApiCallFailed {
        model: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 返回内容为空
    #[error("LLM返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    /// 不支持的 API 类型
    #[error("不支持的API类型: {0}")]
    UnsupportedApiType(String),
    /// 模型连通性测试失败
    #[error("以下模型连接失败: {}", .models.join(", "))]
    Connectivity { models: Vec<String> },
}

/// 调度器错误
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// 调度器未运行
    #[error("调度器未运行，无法提交批次 {0}")]
    NotRunning(BatchId),
    /// 工作池任务异常退出
    #[error("批次 {batch_id} 处理任务异常退出: {message}")]
    WorkerPanicked { batch_id: BatchId, message: String },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置项取值非法
    #[error("配置项 {field} 取值非法: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Other(format!("JSON解析失败: {}", err))
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建LLM API调用错误
    pub fn llm_api_failed(
        model: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::Llm(LlmError::ApiCallFailed {
            model: model.into(),
            source: Box::new(source),
        })
    }

    /// 创建非法状态转换错误
    pub fn invalid_transition(batch_id: BatchId, from: BatchStatus, to: BatchStatus) -> Self {
        AppError::State(StateError::InvalidTransition { batch_id, from, to })
    }

    /// 是否为锁竞争导致的失败（可稍后重试）
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, AppError::State(StateError::LockTimeout { .. }))
    }

    /// 是否为非法状态转换
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, AppError::State(StateError::InvalidTransition { .. }))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = AppError::invalid_transition(7, BatchStatus::Paused, BatchStatus::Paused);
        assert!(err.is_invalid_transition());
        assert_eq!(
            err.to_string(),
            "状态错误: 批次 7 不允许从 PAUSED 转换为 PAUSED"
        );

        let err = AppError::from(LlmError::Connectivity {
            models: vec!["gpt-a".to_string(), "gpt-b".to_string()],
        });
        assert_eq!(err.to_string(), "LLM错误: 以下模型连接失败: gpt-a, gpt-b");
    }
}
