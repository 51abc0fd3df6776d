//! Pipeline orchestration: one task per request, driving every step.
//!
//! `PrivacyPipeline` owns the seams (detector, gateway, store) and runs the
//! detection → planning → fragmentation → enhancement → distribution →
//! aggregation chain for each submitted query. The placeholder map never
//! leaves this task; the store only ever sees redacted fragments and the
//! final de-anonymized response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::{self, AggregationError, FinalResult};
use crate::config::PipelineConfig;
use crate::detection::{DetectionError, Detector, RegexDetector};
use crate::enhancer;
use crate::fragmenter::{self, Fragment, FragmentType, FragmentationError, PlaceholderMap};
use crate::gateway::{GenerateGateway, NoopUsageSink, ProviderError, ProviderGateway};
use crate::planner::{self, Strategy};
use crate::progress::{CompletionSummary, PipelineStep, ProgressTracker, StepEvent};
use crate::router::{self, DistributionError};
use crate::store::{MemoryStateStore, RequestPhase, RequestState, StateStore};
use crate::Query;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("planning failed: {0}")]
    Planning(String),
    #[error("fragmentation failed: {0}")]
    Fragmentation(#[from] FragmentationError),
    #[error("distribution failed: {0}")]
    Distribution(#[from] DistributionError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("request cancelled")]
    Cancelled,
    #[error("request deadline exceeded")]
    Timeout,
}

impl PipelineError {
    /// Step to blame in the failure event, when one is identifiable.
    fn step(&self) -> Option<PipelineStep> {
        match self {
            Self::Detection(_) => Some(PipelineStep::Detection),
            Self::Planning(_) => Some(PipelineStep::Planning),
            Self::Fragmentation(_) => Some(PipelineStep::Fragmentation),
            Self::Distribution(_) => Some(PipelineStep::Distribution),
            Self::Aggregation(_) => Some(PipelineStep::Aggregation),
            _ => None,
        }
    }
}

/// Outcome of a result fetch by request id.
#[derive(Debug)]
pub enum Fetched {
    Ready(FinalResult),
    /// Still running; carries the current phase.
    NotReady(RequestPhase),
    Failed(String),
    /// Unknown id, or the entry expired out of the store.
    NotFound,
}

/// The service façade: submit queries, stream progress, fetch results.
pub struct PrivacyPipeline {
    config: PipelineConfig,
    detector: Arc<dyn Detector>,
    gateway: Arc<dyn GenerateGateway>,
    store: Arc<dyn StateStore>,
    cancels: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl PrivacyPipeline {
    pub fn new(
        config: PipelineConfig,
        detector: Arc<dyn Detector>,
        gateway: Arc<dyn GenerateGateway>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            detector,
            gateway,
            store,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: built-in detector, HTTP gateway over the configured
    /// provider table, in-memory store. Fails if a configured API key is
    /// missing from the environment.
    pub fn from_config(config: PipelineConfig) -> Result<Self, ProviderError> {
        let gateway = ProviderGateway::from_config(&config, Arc::new(NoopUsageSink))?;
        let store = MemoryStateStore::shared(config.state_ttl);
        Ok(Self::new(
            config,
            Arc::new(RegexDetector::new()),
            Arc::new(gateway),
            store,
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Accept a query, spawn its pipeline task, and hand back the request id
    /// plus the event stream. Returns immediately.
    pub fn submit(self: &Arc<Self>, query: Query) -> (Uuid, mpsc::UnboundedReceiver<StepEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = query.id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.run_with_events(query, Some(tx)).await {
                tracing::warn!(request = %id, error = %err, "pipeline failed");
            }
        });
        (id, rx)
    }

    /// Run a query to completion on the caller's task. Used by the CLI and
    /// by tests that want the result directly.
    pub async fn run(&self, query: Query) -> Result<FinalResult, PipelineError> {
        self.run_with_events(query, None).await
    }

    /// Cancel an in-flight request. Returns false if it is not running.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.cancels.lock().await.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Look up a request's result by id.
    pub async fn fetch(&self, id: Uuid) -> Fetched {
        match self.store.get(id).await {
            None => Fetched::NotFound,
            Some(state) => match state.phase {
                RequestPhase::Completed => match state.result {
                    Some(result) => Fetched::Ready(result),
                    None => Fetched::Failed("completed without a result".into()),
                },
                RequestPhase::Failed => {
                    Fetched::Failed(state.failure_reason.unwrap_or_else(|| "unknown".into()))
                }
                phase => Fetched::NotReady(phase),
            },
        }
    }

    pub async fn run_with_events(
        &self,
        query: Query,
        tx: Option<mpsc::UnboundedSender<StepEvent>>,
    ) -> Result<FinalResult, PipelineError> {
        let id = query.id;
        let started = Instant::now();
        let cancel = CancellationToken::new();
        self.cancels.lock().await.insert(id, cancel.clone());

        let mut tracker = ProgressTracker::new(id, tx);
        let mut state = RequestState::new(id, query.text.clone());
        state.phase = RequestPhase::Processing;
        self.store.put(state.clone()).await;

        let outcome = tokio::select! {
            r = tokio::time::timeout(
                self.config.request_timeout,
                self.execute(&query, &mut tracker, &mut state, &cancel, started),
            ) => match r {
                Ok(inner) => inner,
                Err(_) => Err(PipelineError::Timeout),
            },
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        };

        self.cancels.lock().await.remove(&id);

        // Persist the terminal state before publishing the terminal event:
        // consumers fetch as soon as they see it.
        state.step_states = tracker.statuses().clone();
        match &outcome {
            Ok(result) => {
                state.phase = RequestPhase::Completed;
                state.result = Some(result.clone());
            }
            Err(err) => {
                state.phase = RequestPhase::Failed;
                state.failure_reason = Some(err.to_string());
            }
        }
        state.touch();
        self.store.put(state).await;

        match &outcome {
            Ok(result) => {
                tracker.finish(CompletionSummary {
                    request_id: id,
                    fragment_count: result.fragment_count,
                    providers_used: result.providers_used.len(),
                    privacy_score: result.privacy_score,
                    total_cost_nanodollars: result.cost_comparison.fragmented_cost_nanodollars,
                    total_time_ms: result.total_time_ms,
                    response: result.response.clone(),
                });
                tracing::info!(
                    request = %id,
                    fragments = result.fragment_count,
                    privacy = result.privacy_score,
                    degraded = result.degraded,
                    "pipeline completed"
                );
            }
            Err(err) => {
                tracker.finish_error(err.to_string(), err.step());
                tracing::warn!(request = %id, error = %err, "pipeline failed");
            }
        }

        outcome
    }

    async fn execute(
        &self,
        query: &Query,
        tracker: &mut ProgressTracker,
        state: &mut RequestState,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<FinalResult, PipelineError> {
        // Detection. A failing engine gets one retry, then the request fails;
        // a query is never processed unprotected.
        tracker.begin(PipelineStep::Detection, "scanning for sensitive content");
        let report = match self.detector.detect(&query.text) {
            Ok(report) => report,
            Err(first) => {
                tracing::warn!(error = %first, "detection failed, retrying once");
                match self.detector.detect(&query.text) {
                    Ok(report) => report,
                    Err(second) => {
                        tracker.fail(PipelineStep::Detection, second.to_string());
                        return Err(second.into());
                    }
                }
            }
        };
        tracker.complete_with(
            PipelineStep::Detection,
            if report.has_sensitive_content() {
                "sensitive content found"
            } else {
                "nothing sensitive found"
            },
            serde_json::json!({
                "pii_entities": report.pii_entities.len(),
                "code_spans": report.code_spans.len(),
            }),
        );
        state.detection = Some(report.clone());
        self.checkpoint(tracker, state).await;

        // Planning is a pure function over the report; it cannot fail.
        tracker.begin(PipelineStep::Planning, "choosing a fragmentation strategy");
        let plan = planner::plan(query, &report);
        tracker.complete_with(
            PipelineStep::Planning,
            plan.decision_rationale.clone(),
            serde_json::json!({
                "strategy": plan.strategy.as_str(),
                "complexity": plan.complexity_score,
            }),
        );
        state.plan = Some(plan.clone());
        self.checkpoint(tracker, state).await;

        // Fragmentation and enhancement. When the plan says the query is not
        // worth splitting, both steps are inapplicable and the full query
        // goes out as one fragment.
        let (mut fragments, placeholders) = if plan.strategy == Strategy::None {
            tracker.skip(PipelineStep::Fragmentation, "query not split");
            tracker.skip(PipelineStep::Enhancement, "query not split");
            let fragment = Fragment {
                id: "f1".into(),
                order: 0,
                content: query.text.clone(),
                fragment_type: FragmentType::General,
                context_refs: Vec::new(),
                provider_hint: None,
                framing: None,
            };
            (vec![fragment], PlaceholderMap::new())
        } else {
            tracker.begin(PipelineStep::Fragmentation, "splitting the query");
            let (fragments, placeholders) =
                match fragmenter::fragment(&query.text, &report, &plan) {
                    Ok(out) => out,
                    Err(err) => {
                        tracker.fail(PipelineStep::Fragmentation, err.to_string());
                        return Err(err.into());
                    }
                };
            tracker.complete_with(
                PipelineStep::Fragmentation,
                format!("{} fragments", fragments.len()),
                serde_json::json!({ "fragments": fragments.len() }),
            );
            (fragments, placeholders)
        };

        if fragments.len() > 1 {
            tracker.begin(PipelineStep::Enhancement, "framing fragments");
            enhancer::enhance(&mut fragments, &plan);
            tracker.complete(PipelineStep::Enhancement, "fragments framed");
        } else if tracker.status(PipelineStep::Enhancement)
            == crate::progress::StepStatus::Pending
        {
            tracker.skip(PipelineStep::Enhancement, "single fragment");
        }
        state.fragments = fragments.clone();
        self.checkpoint(tracker, state).await;

        // Distribution.
        tracker.begin(
            PipelineStep::Distribution,
            format!("dispatching {} fragments", fragments.len()),
        );
        let assignments =
            match router::assign(&fragments, &self.config.providers, plan.complexity_score) {
                Ok(a) => a,
                Err(err) => {
                    tracker.fail(PipelineStep::Distribution, err.to_string());
                    return Err(err.into());
                }
            };
        let assignments = match router::distribute(
            assignments,
            &fragments,
            self.gateway.as_ref(),
            &self.config,
            query.id,
            cancel,
        )
        .await
        {
            Ok(a) => a,
            Err(DistributionError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                tracker.fail(PipelineStep::Distribution, err.to_string());
                return Err(err.into());
            }
        };
        let succeeded = assignments.iter().filter(|a| a.succeeded()).count();
        tracker.complete_with(
            PipelineStep::Distribution,
            format!("{succeeded}/{} fragments answered", assignments.len()),
            serde_json::json!({
                "succeeded": succeeded,
                "failed": assignments.len() - succeeded,
            }),
        );
        state.assignments = assignments.clone();
        self.checkpoint(tracker, state).await;

        // Aggregation; placeholders are resolved here and nowhere else.
        tracker.begin(PipelineStep::Aggregation, "merging responses");
        let mut result = match aggregator::aggregate(
            query.id,
            &fragments,
            &assignments,
            &placeholders,
            &plan,
        ) {
            Ok(result) => result,
            Err(err) => {
                tracker.fail(PipelineStep::Aggregation, err.to_string());
                return Err(err.into());
            }
        };
        result.total_time_ms = started.elapsed().as_millis() as u64;
        tracker.complete(PipelineStep::Aggregation, "response assembled");

        Ok(result)
    }

    async fn checkpoint(&self, tracker: &ProgressTracker, state: &mut RequestState) {
        state.step_states = tracker.statuses().clone();
        state.touch();
        self.store.put(state.clone()).await;
    }
}
