#![forbid(unsafe_code)]

//! # veilsplit
//!
//! Privacy-preserving query fragmentation across LLM providers.
//!
//! A query that mixes sensitive material (PII, secrets, code) with an actual
//! question gets detected, split into fragments, and fanned out so that no
//! single provider ever sees the full context. PII is replaced by placeholder
//! tokens before anything leaves the process; the partial answers are merged
//! and de-anonymized locally, with privacy and cost metrics attached.
//!
//! ```no_run
//! use std::sync::Arc;
//! use veilsplit::{PipelineConfig, PrivacyPipeline, Query};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Arc::new(PrivacyPipeline::from_config(PipelineConfig::default())?);
//! let result = pipeline
//!     .run(Query::new("My email is jane@example.com, how do I rotate it safely?"))
//!     .await?;
//! println!("{}", result.response);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod config;
pub mod detection;
pub mod enhancer;
pub mod fragmenter;
pub mod gateway;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod router;
pub mod store;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use aggregator::{AggregationError, CostComparison, FinalResult};
pub use config::{CostTier, PipelineConfig, ProviderProfile};
pub use detection::{DetectionReport, Detector, PiiEntity, PiiEntityType, RegexDetector};
pub use fragmenter::{Fragment, FragmentType, PlaceholderMap};
pub use gateway::{GenerateGateway, GenerateRequest, GenerateResponse, ProviderGateway};
pub use orchestrator::{Fetched, PipelineError, PrivacyPipeline};
pub use planner::{FragmentationPlan, Strategy};
pub use progress::{PipelineStep, ProgressTracker, StepEvent, StepStatus};
pub use router::{AssignmentStatus, ProviderAssignment};
pub use store::{MemoryStateStore, RequestPhase, RequestState, StateStore};

/// How aggressively the caller wants the query protected, beyond what
/// detection alone would decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Standard,
    High,
}

/// A query submitted to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    /// Honored only when at least as protective as the planner's choice.
    pub strategy_hint: Option<Strategy>,
    pub privacy_level: Option<PrivacyLevel>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            strategy_hint: None,
            privacy_level: None,
        }
    }

    pub fn strategy_hint(mut self, strategy: Strategy) -> Self {
        self.strategy_hint = Some(strategy);
        self
    }

    pub fn privacy_level(mut self, level: PrivacyLevel) -> Self {
        self.privacy_level = Some(level);
        self
    }
}
