//! Writer worker: turns raw research notes into an executive summary.
//!
//! The task payload is the notes, usually a researcher's output handed
//! over by [`Supervisor::hand_off`](crate::supervisor::Supervisor::hand_off).
//! The published text carries a short header naming the model and the
//! source task so a reader can trace it back.

use std::sync::Arc;

use async_trait::async_trait;

use super::completion::{complete, Prompt};
use super::session::{SessionSummary, SessionTally};
use super::{ExecutionError, WorkOutcome, Worker};
use crate::accountant::Approval;
use crate::budget::{PricingInfo, WorkerClass};
use crate::llm::LlmClient;
use crate::task::Task;

const SYSTEM_PROMPT: &str = "You are a professional technical writer. \
Turn raw research notes into a polished executive summary with clear headings. \
Write for executives: short paragraphs, no jargon, no invented facts.";

/// Request sent to the model for one set of notes.
fn brief(notes: &str) -> String {
    format!(
        "Format these notes into an executive summary.\n\n\
         RAW RESEARCH NOTES:\n{}\n\n\
         Include a clear title, a one-paragraph overview, the key findings \
         under headings, and a short conclusion with recommendations.",
        notes.trim()
    )
}

pub struct WriterWorker {
    llm: Arc<dyn LlmClient>,
    model: String,
    class: WorkerClass,
    pricing: PricingInfo,
    description: String,
    session: SessionTally,
}

impl WriterWorker {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        class: WorkerClass,
        pricing: PricingInfo,
    ) -> Self {
        let model = model.into();
        let description = format!("Writer ({}, {})", class, model);
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
impl Worker for WriterWorker {
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
        if task.payload().trim().is_empty() {
            return Err(ExecutionError::new("no notes to write up"));
        }
        tracing::debug!(
            task_id = %task.id(),
            model = %self.model,
            approved_cents = approval.amount_cents,
            "Writer calling LLM"
        );

        let request = brief(task.payload());
        let prompt = Prompt {
            llm: self.llm.as_ref(),
            model: &self.model,
            pricing: self.pricing,
            system: SYSTEM_PROMPT,
            user: &request,
        };
        let mut outcome = complete(prompt, &self.session).await?;

        let model = outcome.model_used.as_deref().unwrap_or(&self.model);
        outcome.output = format!(
            "# Executive Summary\n_Model: {} | Task: {}_\n\n{}",
            model,
            task.id(),
            outcome.output.trim()
        );
        Ok(outcome)
    }
}
