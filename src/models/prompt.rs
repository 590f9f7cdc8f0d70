use serde::Deserialize;
use std::collections::HashMap;

use super::QuestionType;

/// 某一题型的回答要求
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TypePrompt {
    pub template: String,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub response_example: Option<String>,
}

/// 回答提示词组装配置
///
/// 组装顺序：基础系统提示、题型要求、最终指示、问题正文，各段之间用分隔符连接
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PromptTemplate {
    pub base_system_prompt: Option<String>,
    pub question_type_header: Option<String>,
    /// 键为题型名，如 `SINGLE_CHOICE`
    pub type_prompts: HashMap<String, TypePrompt>,
    pub final_instruction: Option<String>,
    pub section_separator: String,
}

impl PromptTemplate {
    pub fn type_prompt(&self, question_type: QuestionType) -> Option<&TypePrompt> {
        self.type_prompts.get(question_type.as_str())
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            base_system_prompt: None,
            question_type_header: None,
            type_prompts: HashMap::new(),
            final_instruction: None,
            section_separator: "\n\n".to_string(),
        }
    }
}
