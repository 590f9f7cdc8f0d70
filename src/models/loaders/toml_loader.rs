use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{AppError, AppResult, FileError};
use crate::models::{DatasetId, LlmModel, PromptTemplate, Question};

/// 数据集文件：一份问题列表加上需要回答它们的模型
///
/// ```toml
/// name = "常识问答"
/// dataset_id = 1
/// repeat_count = 2
///
/// [[models]]
/// id = 1
/// name = "gpt-4o-mini"
/// api_url = "https://api.openai.com/v1"
/// api_key = "sk-..."
/// api_type = "openai"
///
/// [[questions]]
/// id = 100
/// text = "中国的首都是哪里？"
/// question_type = "SIMPLE_FACT"
///
/// [prompt]
/// base_system_prompt = "你是一个严谨的答题助手。"
/// question_type_header = "回答要求:"
///
/// [prompt.type_prompts.SIMPLE_FACT]
/// template = "请直接给出事实性答案。"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetFile {
    pub name: String,
    pub dataset_id: DatasetId,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    #[serde(default)]
    pub global_parameters: Map<String, Value>,
    pub models: Vec<LlmModel>,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub prompt: PromptTemplate,
    #[serde(skip)]
    pub file_path: Option<String>,
}

fn default_repeat_count() -> u32 {
    1
}

/// 从 TOML 文件加载数据集
pub async fn load_dataset_file(path: &Path) -> AppResult<DatasetFile> {
    let display = path.display().to_string();
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| FileError::ReadFailed {
            path: display.clone(),
            source,
        })?;

    let mut dataset: DatasetFile =
        toml::from_str(&content).map_err(|source| FileError::TomlParseFailed {
            path: display.clone(),
            source,
        })?;

    dataset.file_path = Some(display);
    Ok(dataset)
}

/// 从文件夹中加载所有数据集文件，解析失败的文件跳过并记录警告
pub async fn load_all_dataset_files(folder_path: &str) -> AppResult<Vec<DatasetFile>> {
    let folder = PathBuf::from(folder_path);

    let mut entries = fs::read_dir(&folder)
        .await
        .map_err(|source| FileError::ReadFailed {
            path: folder_path.to_string(),
            source,
        })?;

    let mut datasets = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| {
        AppError::File(FileError::ReadFailed {
            path: folder_path.to_string(),
            source,
        })
    })? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("toml") {
            continue;
        }

        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_dataset_file(&path).await {
            Ok(dataset) => {
                tracing::info!(
                    "成功加载 {} 个问题, {} 个模型",
                    dataset.questions.len(),
                    dataset.models.len()
                );
                datasets.push(dataset);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {}", path.display(), e);
            }
        }
    }

    Ok(datasets)
}
