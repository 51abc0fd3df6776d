//! Request state persistence.
//!
//! The store is a cache keyed by request id, not a system of record: entries
//! expire after a TTL and a restart loses everything. `RequestState` holds
//! everything a caller may fetch later. The placeholder mapping is
//! deliberately absent; it lives only inside the running pipeline task.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::aggregator::FinalResult;
use crate::detection::DetectionReport;
use crate::fragmenter::Fragment;
use crate::planner::FragmentationPlan;
use crate::progress::{PipelineStep, StepStatus};
use crate::router::ProviderAssignment;

/// Request-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Received,
    Processing,
    Completed,
    Failed,
}

/// Everything persisted about one request. Serializable end to end; raw PII
/// appears only inside `query_text` and the final response, never in
/// fragment contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestState {
    pub id: Uuid,
    pub query_text: String,
    pub phase: RequestPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub detection: Option<DetectionReport>,
    pub plan: Option<FragmentationPlan>,
    pub fragments: Vec<Fragment>,
    pub assignments: Vec<ProviderAssignment>,
    pub step_states: BTreeMap<PipelineStep, StepStatus>,
    pub result: Option<FinalResult>,
    pub failure_reason: Option<String>,
}

impl RequestState {
    pub fn new(id: Uuid, query_text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            query_text: query_text.into(),
            phase: RequestPhase::Received,
            created_at: now,
            updated_at: now,
            detection: None,
            plan: None,
            fragments: Vec::new(),
            assignments: Vec::new(),
            step_states: PipelineStep::ALL
                .iter()
                .map(|s| (*s, StepStatus::Pending))
                .collect(),
            result: None,
            failure_reason: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, RequestPhase::Completed | RequestPhase::Failed)
    }
}

/// Storage seam. Production deployments can wire a shared backend; the
/// default is in-process memory with TTL eviction.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, state: RequestState);
    async fn get(&self, id: Uuid) -> Option<RequestState>;
    async fn remove(&self, id: Uuid) -> Option<RequestState>;
}

struct Entry {
    state: RequestState,
    expires_at: Instant,
}

/// In-memory store with lazy TTL eviction: expired entries are dropped on
/// access and swept opportunistically on writes.
pub struct MemoryStateStore {
    ttl: Duration,
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl MemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared(ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(ttl))
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, state: RequestState) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            state.id,
            Entry {
                state,
                expires_at: now + self.ttl,
            },
        );
    }

    async fn get(&self, id: Uuid) -> Option<RequestState> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .get(&id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.state.clone())
    }

    async fn remove(&self, id: Uuid) -> Option<RequestState> {
        self.entries.write().await.remove(&id).map(|e| e.state)
    }
}
