use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::LlmError;
use super::{ModelId, QuestionId};

/// 题型
///
/// 不同题型对应不同的回答要求，由提示词组装按题型分别处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    SimpleFact,
    Subjective,
}

impl QuestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "SINGLE_CHOICE",
            QuestionType::MultipleChoice => "MULTIPLE_CHOICE",
            QuestionType::SimpleFact => "SIMPLE_FACT",
            QuestionType::Subjective => "SUBJECTIVE",
        }
    }
}

/// 标准问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub text: String,
    pub question_type: QuestionType,
}

impl Question {
    pub fn new(id: QuestionId, text: impl Into<String>, question_type: QuestionType) -> Self {
        Self {
            id,
            text: text.into(),
            question_type,
        }
    }
}

/// LLM 接口类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiType {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiType::OpenAi => "openai",
            ApiType::OpenAiCompatible => "openai_compatible",
            ApiType::Anthropic => "anthropic",
        };
        f.write_str(name)
    }
}

impl FromStr for ApiType {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ApiType::OpenAi),
            "openai_compatible" => Ok(ApiType::OpenAiCompatible),
            "anthropic" => Ok(ApiType::Anthropic),
            other => Err(LlmError::UnsupportedApiType(other.to_string())),
        }
    }
}

/// 被评测的 LLM 模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmModel {
    pub id: ModelId,
    /// 模型名称，同时作为请求中的 model 字段
    pub name: String,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    pub api_type: ApiType,
    /// 模型默认参数（优先级最低）
    #[serde(default)]
    pub model_parameters: Map<String, Value>,
}
