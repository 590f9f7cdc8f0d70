//! 提示词组装 - 业务能力层
//!
//! 只负责把运行和问题拼成发送给模型的文本，不关心调用和持久化

use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::{BatchId, PromptTemplate, Question, Run};

/// 提示词组装
pub trait PromptAssembler: Send + Sync {
    fn build(&self, run: &Run, question: &Question) -> String;
}

/// 基于模板配置的提示词组装
#[derive(Debug, Clone, Default)]
pub struct TemplatePromptAssembler {
    template: PromptTemplate,
}

impl TemplatePromptAssembler {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }
}

impl PromptAssembler for TemplatePromptAssembler {
    fn build(&self, _run: &Run, question: &Question) -> String {
        let t = &self.template;
        let mut prompt = String::new();

        if let Some(base) = &t.base_system_prompt {
            prompt.push_str(base);
            prompt.push_str(&t.section_separator);
        }

        if let Some(header) = &t.question_type_header {
            prompt.push_str(header);
            prompt.push('\n');
            if let Some(type_prompt) = t.type_prompt(question.question_type) {
                prompt.push_str(&type_prompt.template);
                if let Some(format) = type_prompt.response_format.as_deref().filter(|s| !s.is_empty()) {
                    prompt.push_str("\n\n回答格式要求:\n");
                    prompt.push_str(format);
                }
                if let Some(example) = type_prompt.response_example.as_deref().filter(|s| !s.is_empty()) {
                    prompt.push_str("\n\n回答示例:\n");
                    prompt.push_str(example);
                }
            }
            prompt.push_str(&t.section_separator);
        }

        if let Some(final_instruction) = &t.final_instruction {
            prompt.push_str(final_instruction);
            prompt.push_str(&t.section_separator);
        }

        prompt.push_str("问题: ");
        prompt.push_str(&question.text);
        prompt
    }
}

/// 按批次选择模板的提示词组装
///
/// 每个批次来自各自的数据集文件，模板随批次登记；未登记的批次使用默认模板
#[derive(Default)]
pub struct BatchPromptRegistry {
    templates: RwLock<HashMap<BatchId, TemplatePromptAssembler>>,
    fallback: TemplatePromptAssembler,
}

impl BatchPromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, batch_id: BatchId, template: PromptTemplate) {
        if let Ok(mut templates) = self.templates.write() {
            templates.insert(batch_id, TemplatePromptAssembler::new(template));
        }
    }
}

impl PromptAssembler for BatchPromptRegistry {
    fn build(&self, run: &Run, question: &Question) -> String {
        match self.templates.read() {
            Ok(templates) => templates
                .get(&run.batch_id)
                .unwrap_or(&self.fallback)
                .build(run, question),
            Err(_) => self.fallback.build(run, question),
        }
    }
}
