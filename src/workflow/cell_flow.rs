//! 单元处理流程 - 流程层
//!
//! 核心职责：定义"一个单元"的完整处理流程
//!
//! 流程顺序：
//! 1. 已有回答 → 直接计为完成
//! 2. 组装提示词 → 调用 LLM
//! 3. 成功写入回答，失败只记录在本单元

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clients::{GenerateRequest, LlmClient};
use crate::error::AppResult;
use crate::infrastructure::WorkStore;
use crate::models::{Answer, AnswerInsert, EventKind, LlmModel, Question, Run};
use crate::services::{Notifier, PromptAssembler};
use crate::utils::logging::truncate_text;
use crate::workflow::cell_ctx::CellCtx;

/// 单元处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOutcome {
    /// 本次生成并写入了回答
    Answered,
    /// 之前的遍历已经写入过回答
    AlreadyAnswered,
    /// LLM 调用失败，不在本轮重试
    Failed(String),
}

/// 单元处理流程
///
/// - 只处理单个单元，不关心遍历顺序和中断
/// - LLM 错误转换为 `CellOutcome::Failed`，存储错误向上传播
pub struct CellFlow {
    store: Arc<dyn WorkStore>,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<dyn PromptAssembler>,
    notifier: Notifier,
    verbose_logging: bool,
}

impl CellFlow {
    pub fn new(
        store: Arc<dyn WorkStore>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<dyn PromptAssembler>,
        notifier: Notifier,
        verbose_logging: bool,
    ) -> Self {
        Self {
            store,
            llm,
            prompts,
            notifier,
            verbose_logging,
        }
    }

    pub async fn run(
        &self,
        ctx: &CellCtx,
        run: &Run,
        model: &LlmModel,
        question: &Question,
        parameters: &Map<String, Value>,
    ) -> AppResult<CellOutcome> {
        let cell = &ctx.cell;

        if self
            .store
            .has_answer(cell.run_id, cell.question_id, cell.repeat_index)
            .await?
        {
            debug!("{} 已有回答，跳过", ctx);
            return Ok(CellOutcome::AlreadyAnswered);
        }

        self.notifier.run_message(
            run.id,
            EventKind::QuestionStarted,
            json!({
                "runId": run.id,
                "questionId": question.id,
                "repeatIndex": cell.repeat_index,
            }),
        );

        let prompt = self.prompts.build(run, question);
        if self.verbose_logging {
            info!("{} 📝 提示词: {}", ctx, truncate_text(&prompt, 80));
        }

        let request = GenerateRequest::for_model(model, prompt.clone(), parameters.clone());
        match self.llm.generate(request).await {
            Ok(text) => {
                let preview = truncate_text(&text, 50);
                let inserted = self
                    .store
                    .insert_answer(Answer::for_cell(cell, text, prompt))
                    .await?;
                if inserted == AnswerInsert::Duplicate {
                    debug!("{} 回答已被其他执行者写入", ctx);
                    return Ok(CellOutcome::AlreadyAnswered);
                }

                info!("{} ✓ 回答已保存: {}", ctx, preview);
                self.notifier.run_message(
                    run.id,
                    EventKind::QuestionCompleted,
                    json!({
                        "runId": run.id,
                        "questionId": question.id,
                        "repeatIndex": cell.repeat_index,
                        "answerPreview": preview,
                    }),
                );
                Ok(CellOutcome::Answered)
            }
            Err(e) => {
                let message = e.to_string();
                warn!("{} ⚠️ 生成回答失败: {}", ctx, message);
                self.notifier.run_message(
                    run.id,
                    EventKind::QuestionFailed,
                    json!({
                        "runId": run.id,
                        "questionId": question.id,
                        "repeatIndex": cell.repeat_index,
                        "error": message,
                    }),
                );
                Ok(CellOutcome::Failed(message))
            }
        }
    }
}
