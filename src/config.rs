use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppResult, ConfigError, FileError};

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 数据集 TOML 文件存放目录
    pub dataset_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 启动或恢复前是否测试模型连通性
    pub check_model_connectivity: bool,
    // --- 恢复调度 ---
    /// 调度器巡检间隔（秒）
    pub scheduler_interval_secs: u64,
    /// 最近活动在该窗口内视为仍在执行（秒）
    pub activity_window_secs: u64,
    /// 最近巡检在该窗口内视为仍在执行（秒）
    pub check_window_secs: u64,
    /// 工作池并发上限
    pub worker_pool_size: usize,
    /// 关闭时等待工作池排空的时间（秒）
    pub shutdown_timeout_secs: u64,
    // --- 状态协调 ---
    pub lock_wait_ms: u64,
    pub lock_lease_ms: u64,
    pub reconcile_lock_wait_ms: u64,
    pub reconcile_lock_lease_ms: u64,
    /// 状态缓存与中断标志的过期时间（秒）
    pub cache_ttl_secs: u64,
    /// 单个运行的执行租约（秒），每处理一个单元续租一次
    pub run_lease_secs: u64,
    // --- LLM 配置 ---
    pub llm_request_timeout_secs: u64,
    /// 数据集未声明模型时使用的默认模型
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_folder: "datasets".to_string(),
            verbose_logging: false,
            check_model_connectivity: true,
            scheduler_interval_secs: 30,
            activity_window_secs: 180,
            check_window_secs: 60,
            worker_pool_size: 5,
            shutdown_timeout_secs: 60,
            lock_wait_ms: 5_000,
            lock_lease_ms: 30_000,
            reconcile_lock_wait_ms: 2_000,
            reconcile_lock_lease_ms: 10_000,
            cache_ttl_secs: 24 * 60 * 60,
            run_lease_secs: 180,
            llm_request_timeout_secs: 120,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
        }
    }
}

/// 读取环境变量；未设置时使用默认值，设置了但无法解析时报错
fn env_or<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::EnvVarParseFailed {
            var_name: var_name.to_string(),
            value,
            expected_type: std::any::type_name::<T>().to_string(),
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        let default = Self::default();
        let config = Self {
            dataset_folder: env_or("DATASET_FOLDER", default.dataset_folder)?,
            verbose_logging: env_or("VERBOSE_LOGGING", default.verbose_logging)?,
            check_model_connectivity: env_or("CHECK_MODEL_CONNECTIVITY", default.check_model_connectivity)?,
            scheduler_interval_secs: env_or("SCHEDULER_INTERVAL_SECS", default.scheduler_interval_secs)?,
            activity_window_secs: env_or("ACTIVITY_WINDOW_SECS", default.activity_window_secs)?,
            check_window_secs: env_or("CHECK_WINDOW_SECS", default.check_window_secs)?,
            worker_pool_size: env_or("WORKER_POOL_SIZE", default.worker_pool_size)?,
            shutdown_timeout_secs: env_or("SHUTDOWN_TIMEOUT_SECS", default.shutdown_timeout_secs)?,
            lock_wait_ms: env_or("LOCK_WAIT_MS", default.lock_wait_ms)?,
            lock_lease_ms: env_or("LOCK_LEASE_MS", default.lock_lease_ms)?,
            reconcile_lock_wait_ms: env_or("RECONCILE_LOCK_WAIT_MS", default.reconcile_lock_wait_ms)?,
            reconcile_lock_lease_ms: env_or("RECONCILE_LOCK_LEASE_MS", default.reconcile_lock_lease_ms)?,
            cache_ttl_secs: env_or("CACHE_TTL_SECS", default.cache_ttl_secs)?,
            run_lease_secs: env_or("RUN_LEASE_SECS", default.run_lease_secs)?,
            llm_request_timeout_secs: env_or("LLM_REQUEST_TIMEOUT_SECS", default.llm_request_timeout_secs)?,
            llm_api_key: env_or("LLM_API_KEY", default.llm_api_key)?,
            llm_api_base_url: env_or("LLM_API_BASE_URL", default.llm_api_base_url)?,
            llm_model_name: env_or("LLM_MODEL_NAME", default.llm_model_name)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载，缺省字段使用默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| FileError::ReadFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| FileError::TomlParseFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 设置了 `CONFIG_FILE` 时读取该文件，否则读取环境变量
    pub fn load() -> AppResult<Self> {
        match std::env::var("CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => Self::from_toml_file(path.trim()),
            _ => Self::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("worker_pool_size", self.worker_pool_size as u64),
            ("scheduler_interval_secs", self.scheduler_interval_secs),
            ("lock_lease_ms", self.lock_lease_ms),
            ("reconcile_lock_lease_ms", self.reconcile_lock_lease_ms),
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("run_lease_secs", self.run_lease_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "必须大于 0".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.activity_window_secs)
    }

    pub fn check_window(&self) -> Duration {
        Duration::from_secs(self.check_window_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn reconcile_lock_wait(&self) -> Duration {
        Duration::from_millis(self.reconcile_lock_wait_ms)
    }

    pub fn reconcile_lock_lease(&self) -> Duration {
        Duration::from_millis(self.reconcile_lock_lease_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn run_lease(&self) -> Duration {
        Duration::from_secs(self.run_lease_secs)
    }

    pub fn llm_request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_request_timeout_secs)
    }
}
