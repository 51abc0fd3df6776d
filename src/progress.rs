//! Step-level progress tracking and event publishing.
//!
//! Each request carries one [`ProgressTracker`], the sole writer of step
//! state. Every transition goes through it: it enforces the per-step state
//! machine (`pending -> processing -> completed | skipped | failed`) and
//! publishes an immutable [`StepEvent`] on the request's channel. Consumers
//! only ever see events, never mutable state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Pipeline steps in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Detection,
    Planning,
    Fragmentation,
    Enhancement,
    Distribution,
    Aggregation,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 6] = [
        PipelineStep::Detection,
        PipelineStep::Planning,
        PipelineStep::Fragmentation,
        PipelineStep::Enhancement,
        PipelineStep::Distribution,
        PipelineStep::Aggregation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Planning => "planning",
            Self::Fragmentation => "fragmentation",
            Self::Enhancement => "enhancement",
            Self::Distribution => "distribution",
            Self::Aggregation => "aggregation",
        }
    }
}

/// Per-step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Processing,
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }

    /// Legal per-step transitions. Terminal states never move again.
    fn can_become(&self, next: StepStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Processing | Self::Skipped | Self::Failed
            ),
            Self::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

/// Summary metrics attached to the terminal `complete` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub request_id: Uuid,
    pub fragment_count: usize,
    pub providers_used: usize,
    pub privacy_score: f64,
    pub total_cost_nanodollars: i64,
    pub total_time_ms: u64,
    pub response: String,
}

/// Immutable progress event, serialized for the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StepEvent {
    StepProgress {
        request_id: Uuid,
        step: PipelineStep,
        status: StepStatus,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    Complete(CompletionSummary),
    Error {
        request_id: Uuid,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<PipelineStep>,
    },
}

/// Sole writer of step state for one request.
pub struct ProgressTracker {
    request_id: Uuid,
    steps: BTreeMap<PipelineStep, StepStatus>,
    tx: Option<mpsc::UnboundedSender<StepEvent>>,
}

impl ProgressTracker {
    pub fn new(request_id: Uuid, tx: Option<mpsc::UnboundedSender<StepEvent>>) -> Self {
        let steps = PipelineStep::ALL
            .iter()
            .map(|s| (*s, StepStatus::Pending))
            .collect();
        Self {
            request_id,
            steps,
            tx,
        }
    }

    pub fn statuses(&self) -> &BTreeMap<PipelineStep, StepStatus> {
        &self.steps
    }

    pub fn status(&self, step: PipelineStep) -> StepStatus {
        self.steps.get(&step).copied().unwrap_or(StepStatus::Pending)
    }

    pub fn begin(&mut self, step: PipelineStep, message: impl Into<String>) {
        self.transition(step, StepStatus::Processing, message.into(), None, None);
    }

    pub fn complete(&mut self, step: PipelineStep, message: impl Into<String>) {
        self.transition(step, StepStatus::Completed, message.into(), Some(1.0), None);
    }

    pub fn complete_with(
        &mut self,
        step: PipelineStep,
        message: impl Into<String>,
        details: serde_json::Value,
    ) {
        self.transition(
            step,
            StepStatus::Completed,
            message.into(),
            Some(1.0),
            Some(details),
        );
    }

    /// Mark a step inapplicable under the chosen plan.
    pub fn skip(&mut self, step: PipelineStep, message: impl Into<String>) {
        self.transition(step, StepStatus::Skipped, message.into(), None, None);
    }

    pub fn fail(&mut self, step: PipelineStep, message: impl Into<String>) {
        self.transition(step, StepStatus::Failed, message.into(), None, None);
    }

    /// Mid-step progress report; does not change the step status.
    pub fn report(&mut self, step: PipelineStep, message: impl Into<String>, progress: f32) {
        if self.status(step) != StepStatus::Processing {
            return;
        }
        self.publish(StepEvent::StepProgress {
            request_id: self.request_id,
            step,
            status: StepStatus::Processing,
            message: message.into(),
            progress: Some(progress.clamp(0.0, 1.0)),
            details: None,
        });
    }

    /// Terminal success event.
    pub fn finish(&mut self, summary: CompletionSummary) {
        self.publish(StepEvent::Complete(summary));
    }

    /// Terminal failure event.
    pub fn finish_error(&mut self, message: impl Into<String>, step: Option<PipelineStep>) {
        self.publish(StepEvent::Error {
            request_id: self.request_id,
            message: message.into(),
            step,
        });
    }

    fn transition(
        &mut self,
        step: PipelineStep,
        next: StepStatus,
        message: String,
        progress: Option<f32>,
        details: Option<serde_json::Value>,
    ) {
        let current = self.status(step);
        // Pending steps may jump straight to a terminal state (skip, or a
        // failure before the step started). Anything else out of order is a
        // bug in the driver, logged and dropped rather than corrupting state.
        if !current.can_become(next) {
            tracing::warn!(
                request = %self.request_id,
                step = step.as_str(),
                ?current,
                ?next,
                "ignoring illegal step transition"
            );
            return;
        }
        self.steps.insert(step, next);
        self.publish(StepEvent::StepProgress {
            request_id: self.request_id,
            step,
            status: next,
            message,
            progress,
            details,
        });
    }

    fn publish(&self, event: StepEvent) {
        if let Some(tx) = &self.tx {
            // Receiver may be gone (caller stopped listening); fine.
            let _ = tx.send(event);
        }
    }
}
