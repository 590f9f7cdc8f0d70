//! LLM API 客户端
//!
//! 对生成引擎只暴露一个能力：给定模型、提示词和参数，返回回答文本。
//!
//! ## 技术栈
//! - OpenAI 及兼容接口使用 `async-openai`
//! - Anthropic 接口使用 `reqwest` 直接发送 JSON
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, LlmError};
use crate::models::{ApiType, LlmModel};

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1000;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// 一次生成请求
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model_name: String,
    pub endpoint: String,
    pub api_key: String,
    pub api_type: ApiType,
    pub prompt: String,
    /// 已合并好的请求参数，`model` 字段可覆盖模型名称
    pub parameters: Map<String, Value>,
}

impl GenerateRequest {
    pub fn for_model(model: &LlmModel, prompt: impl Into<String>, parameters: Map<String, Value>) -> Self {
        let model_name = parameters
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| model.name.clone());
        Self {
            model_name,
            endpoint: model.api_url.clone(),
            api_key: model.api_key.clone(),
            api_type: model.api_type,
            prompt: prompt.into(),
            parameters,
        }
    }

    fn f32_param(&self, key: &str) -> Option<f32> {
        self.parameters.get(key).and_then(Value::as_f64).map(|v| v as f32)
    }

    fn u32_param(&self, key: &str) -> Option<u32> {
        self.parameters
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }
}

/// LLM 客户端
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 生成回答；失败只影响当前单元，不做重试
    async fn generate(&self, request: GenerateRequest) -> AppResult<String>;

    /// 测试模型连通性
    async fn test_connectivity(&self, model: &LlmModel) -> bool {
        let mut parameters = Map::new();
        parameters.insert("max_tokens".to_string(), json!(10));
        match self
            .generate(GenerateRequest::for_model(model, "测试连接", parameters))
            .await
        {
            Ok(_) => {
                info!("✅ 模型 {} 连接正常", model.name);
                true
            }
            Err(e) => {
                warn!("❌ 模型 {} 连接失败: {}", model.name, e);
                false
            }
        }
    }
}

/// 基于 HTTP 的 LLM 客户端
pub struct HttpLlmClient {
    http: reqwest::Client,
}

impl HttpLlmClient {
    /// 创建新的 LLM 客户端
    pub fn new(config: &Config) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.llm_request_timeout())
            .build()
            .map_err(|e| AppError::llm_api_failed("http-client", e))?;
        Ok(Self { http })
    }

    /// OpenAI 及兼容接口
    async fn openai_chat(&self, request: &GenerateRequest) -> AppResult<String> {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&request.api_key)
            .with_api_base(api_base(&request.endpoint));
        let client = Client::with_config(openai_config);

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(request.prompt.as_str())
            .build()
            .map_err(|e| AppError::llm_api_failed(&request.model_name, e))?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&request.model_name)
            .messages(vec![ChatCompletionRequestMessage::User(user_msg)])
            .temperature(request.f32_param("temperature").unwrap_or(DEFAULT_TEMPERATURE))
            .max_tokens(request.u32_param("max_tokens").unwrap_or(DEFAULT_MAX_TOKENS));
        if let Some(top_p) = request.f32_param("top_p") {
            args.top_p(top_p);
        }
        if let Some(penalty) = request.f32_param("presence_penalty") {
            args.presence_penalty(penalty);
        }
        if let Some(penalty) = request.f32_param("frequency_penalty") {
            args.frequency_penalty(penalty);
        }
        let chat_request = args
            .build()
            .map_err(|e| AppError::llm_api_failed(&request.model_name, e))?;

        let response = client.chat().create(chat_request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            AppError::llm_api_failed(&request.model_name, e)
        })?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                LlmError::EmptyContent {
                    model: request.model_name.clone(),
                }
                .into()
            })
    }

    /// Anthropic Messages 接口
    async fn anthropic_messages(&self, request: &GenerateRequest) -> AppResult<String> {
        let mut body = json!({
            "model": request.model_name,
            "max_tokens": request.u32_param("max_tokens").unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.f32_param("temperature").unwrap_or(DEFAULT_TEMPERATURE),
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(top_p) = request.f32_param("top_p") {
            body["top_p"] = json!(top_p);
        }
        if let Some(top_k) = request.u32_param("top_k") {
            body["top_k"] = json!(top_k);
        }

        let response = self
            .http
            .post(&request.endpoint)
            .header("x-api-key", &request.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!("LLM API 调用失败: {}", e);
                AppError::llm_api_failed(&request.model_name, e)
            })?;

        let value: Value = response
            .json()
            .await
            .map_err(|e| AppError::llm_api_failed(&request.model_name, e))?;

        extract_anthropic_text(&value).ok_or_else(|| {
            LlmError::EmptyContent {
                model: request.model_name.clone(),
            }
            .into()
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, request: GenerateRequest) -> AppResult<String> {
        debug!(
            "调用 LLM API，模型: {}，类型: {}，提示词长度: {} 字符",
            request.model_name,
            request.api_type,
            request.prompt.chars().count()
        );

        let content = match request.api_type {
            ApiType::OpenAi | ApiType::OpenAiCompatible => self.openai_chat(&request).await?,
            ApiType::Anthropic => self.anthropic_messages(&request).await?,
        };

        debug!("LLM API 调用成功");
        Ok(content.trim().to_string())
    }
}

/// `async-openai` 需要的是接口根地址，模型登记的可能是完整的 chat/completions 地址
fn api_base(endpoint: &str) -> &str {
    let endpoint = endpoint.trim_end_matches('/');
    endpoint
        .strip_suffix("/chat/completions")
        .unwrap_or(endpoint)
}

/// 兼容 Messages 接口的 `content[].text` 与旧版 `completion` 字段
fn extract_anthropic_text(value: &Value) -> Option<String> {
    if let Some(blocks) = value.get("content").and_then(Value::as_array) {
        let text: String = blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();
        if !text.is_empty() {
            return Some(text);
        }
    }
    value
        .get("completion")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> LlmModel {
        LlmModel {
            id: 1,
            name: "gpt-4o-mini".to_string(),
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: "sk-test".to_string(),
            api_type: ApiType::OpenAi,
            model_parameters: Map::new(),
        }
    }

    #[test]
    fn test_api_base_strips_completion_path() {
        assert_eq!(api_base("https://api.openai.com/v1/chat/completions"), "https://api.openai.com/v1");
        assert_eq!(api_base("http://localhost:8000/v1/"), "http://localhost:8000/v1");
    }

    #[test]
    fn test_model_parameter_overrides_model_name() {
        let mut parameters = Map::new();
        parameters.insert("model".to_string(), json!("gpt-4o"));
        parameters.insert("temperature".to_string(), json!(0.2));
        parameters.insert("max_tokens".to_string(), json!(256));

        let request = GenerateRequest::for_model(&model(), "问题: 1+1", parameters);
        assert_eq!(request.model_name, "gpt-4o");
        assert_eq!(request.f32_param("temperature"), Some(0.2));
        assert_eq!(request.u32_param("max_tokens"), Some(256));
        assert_eq!(request.u32_param("top_k"), None);

        let request = GenerateRequest::for_model(&model(), "问题: 1+1", Map::new());
        assert_eq!(request.model_name, "gpt-4o-mini");
    }

    #[test]
    fn test_extract_anthropic_text() {
        let messages = json!({"content": [{"type": "text", "text": "答案是 2"}]});
        assert_eq!(extract_anthropic_text(&messages).as_deref(), Some("答案是 2"));

        let legacy = json!({"completion": " 2"});
        assert_eq!(extract_anthropic_text(&legacy).as_deref(), Some(" 2"));

        assert_eq!(extract_anthropic_text(&json!({"content": []})), None);
    }

    #[tokio::test]
    #[ignore] // 需要真实的 API 密钥
    async fn test_real_openai_call() {
        let _ = tracing_subscriber::fmt::try_init();
        let mut config = Config::default();
        config.llm_api_key = std::env::var("LLM_API_KEY").unwrap_or_default();
        let client = HttpLlmClient::new(&config).unwrap();
        let mut model = model();
        model.api_key = config.llm_api_key.clone();
        assert!(client.test_connectivity(&model).await);
    }
}
