//! Researcher worker: answers the task payload with one LLM call.

use std::sync::Arc;

use async_trait::async_trait;

use super::completion::{complete, Prompt};
use super::session::{SessionSummary, SessionTally};
use super::{ExecutionError, WorkOutcome, Worker};
use crate::accountant::Approval;
use crate::budget::{PricingInfo, WorkerClass};
use crate::llm::LlmClient;
use crate::task::Task;

const SYSTEM_PROMPT: &str = "You are a research assistant working under a fixed spend budget. \
Answer the request directly and concisely. Do not ask follow-up questions.";

pub struct ResearcherWorker {
    llm: Arc<dyn LlmClient>,
    model: String,
    class: WorkerClass,
    pricing: PricingInfo,
    description: String,
    session: SessionTally,
}

impl ResearcherWorker {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        class: WorkerClass,
        pricing: PricingInfo,
    ) -> Self {
        let model = model.into();
        let description = format!("Researcher ({}, {})", class, model);
        Self {
            llm,
            model,
            class,
            pricing,
            description,
            session: SessionTally::new(),
        }
    }
}

#[async_trait]
impl Worker for ResearcherWorker {
    fn class(&self) -> WorkerClass {
        self.class
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn session(&self) -> SessionSummary {
        self.session.summary()
    }

    async fn execute(&self, task: &Task, approval: &Approval) -> Result<WorkOutcome, ExecutionError> {
        tracing::debug!(
            task_id = %task.id(),
            model = %self.model,
            approved_cents = approval.amount_cents,
            "Researcher calling LLM"
        );

        let prompt = Prompt {
            llm: self.llm.as_ref(),
            model: &self.model,
            pricing: self.pricing,
            system: SYSTEM_PROMPT,
            user: task.payload(),
        };
        complete(prompt, &self.session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, ChatResponse, TokenUsage};
    use chrono::Utc;

    struct FakeLlm {
        response: Option<ChatResponse>,
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
        ) -> anyhow::Result<ChatResponse> {
            assert_eq!(messages.len(), 2);
            self.response
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    fn approval(task: &Task) -> Approval {
        Approval {
            task_id: task.id(),
            entry_id: 1,
            amount_cents: 10,
            approved_at: Utc::now(),
            trial: false,
        }
    }

    fn worker(response: Option<ChatResponse>) -> ResearcherWorker {
        ResearcherWorker::new(
            Arc::new(FakeLlm { response }),
            "local-7b",
            WorkerClass::Local,
            PricingInfo::new(1.0),
        )
    }

    #[tokio::test]
    async fn test_prices_reported_usage() {
        let task = Task::new("agent", "What regions host our buckets?");
        let w = worker(Some(ChatResponse {
            content: Some("us-east-1".to_string()),
            usage: Some(TokenUsage::new(1_500, 500)),
            model: None,
        }));
        let out = w.execute(&task, &approval(&task)).await.unwrap();
        assert_eq!(out.actual_cost_cents, 2);
        assert_eq!(out.output, "us-east-1");
        assert_eq!(out.model_used.as_deref(), Some("local-7b"));
        assert_eq!(
            w.session(),
            SessionSummary {
                calls: 1,
                total_tokens: 2_000,
                total_cost_cents: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_llm_failure_has_no_cost() {
        let task = Task::new("agent", "anything");
        let w = worker(None);
        let err = w.execute(&task, &approval(&task)).await.unwrap_err();
        assert!(err.message.contains("connection refused"));
        assert_eq!(err.actual_cost_cents, None);
        assert_eq!(w.session().calls, 0);
    }

    #[tokio::test]
    async fn test_empty_answer_reports_spend() {
        let task = Task::new("agent", "anything");
        let w = worker(Some(ChatResponse {
            content: Some("  ".to_string()),
            usage: Some(TokenUsage::new(100, 0)),
            model: Some("local-7b-q4".to_string()),
        }));
        let err = w.execute(&task, &approval(&task)).await.unwrap_err();
        assert_eq!(err.actual_cost_cents, Some(1));
        assert_eq!(w.session().total_cost_cents, 1);
    }
}
