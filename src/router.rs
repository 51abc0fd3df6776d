//! Fragment routing: assignment policy plus concurrent dispatch.
//!
//! `assign` is a pure policy function so it can be tested without any
//! network; `distribute` fans the assignments out through the gateway with
//! `buffer_unordered`, a per-fragment deadline and cancellation. The two
//! halves share nothing but the assignment list.

use std::collections::HashMap;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{CostTier, PipelineConfig, ProviderProfile};
use crate::fragmenter::Fragment;
use crate::gateway::{GenerateGateway, GenerateRequest, ProviderError};

/// Lifecycle of one fragment dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// One fragment bound to one provider, filled in as the call progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAssignment {
    pub fragment_id: String,
    pub provider_id: String,
    pub status: AssignmentStatus,
    pub response: Option<String>,
    pub latency_ms: u64,
    pub tokens_used: u32,
    pub cost_nanodollars: i64,
    pub error: Option<String>,
}

impl ProviderAssignment {
    fn new(fragment_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            fragment_id: fragment_id.into(),
            provider_id: provider_id.into(),
            status: AssignmentStatus::Pending,
            response: None,
            latency_ms: 0,
            tokens_used: 0,
            cost_nanodollars: 0,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == AssignmentStatus::Completed
    }
}

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("all {0} fragment dispatches failed")]
    AllFailed(usize),
    #[error("request cancelled during distribution")]
    Cancelled,
    #[error("no providers configured")]
    NoProviders,
}

/// Pick a provider for every fragment. Pure; no network.
///
/// Policy: sensitive fragments go to strict-data-handling providers, code
/// fragments (and general ones on a complex query) to the premium tier, the
/// rest round-robin so no single provider sees the whole query. An explicit
/// `provider_hint` naming a configured provider wins.
pub fn assign(
    fragments: &[Fragment],
    providers: &[ProviderProfile],
    complexity: f64,
) -> Result<Vec<ProviderAssignment>, DistributionError> {
    if providers.is_empty() {
        return Err(DistributionError::NoProviders);
    }

    let strict: Vec<&ProviderProfile> =
        providers.iter().filter(|p| p.strict_data_handling).collect();
    let premium: Vec<&ProviderProfile> = providers
        .iter()
        .filter(|p| p.cost_tier == CostTier::Premium)
        .collect();
    // Complex queries skip the economy tier for prose too.
    let general_floor = if complexity >= 7.0 {
        CostTier::Standard
    } else {
        CostTier::Economy
    };
    let general: Vec<&ProviderProfile> = providers
        .iter()
        .filter(|p| p.cost_tier >= general_floor)
        .collect();

    let mut strict_rr = 0usize;
    let mut premium_rr = 0usize;
    let mut general_rr = 0usize;

    let mut assignments = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let hinted = fragment
            .provider_hint
            .as_deref()
            .and_then(|id| providers.iter().find(|p| p.id == id));

        let profile = if let Some(p) = hinted {
            p
        } else if fragment.fragment_type.is_sensitive() {
            pick(&strict, &mut strict_rr)
                .or_else(|| pick(&premium, &mut premium_rr))
                .unwrap_or_else(|| round_robin(providers, &mut general_rr))
        } else if fragment.fragment_type == crate::fragmenter::FragmentType::Code {
            pick(&premium, &mut premium_rr)
                .unwrap_or_else(|| round_robin(providers, &mut general_rr))
        } else {
            pick(&general, &mut general_rr)
                .unwrap_or_else(|| round_robin(providers, &mut general_rr))
        };

        assignments.push(ProviderAssignment::new(&fragment.id, &profile.id));
    }

    Ok(assignments)
}

fn pick<'a>(pool: &[&'a ProviderProfile], cursor: &mut usize) -> Option<&'a ProviderProfile> {
    if pool.is_empty() {
        return None;
    }
    let p = pool[*cursor % pool.len()];
    *cursor += 1;
    Some(p)
}

fn round_robin<'a>(providers: &'a [ProviderProfile], cursor: &mut usize) -> &'a ProviderProfile {
    let p = &providers[*cursor % providers.len()];
    *cursor += 1;
    p
}

enum CallError {
    Cancelled,
    Timeout,
    Provider(ProviderError),
}

/// Dispatch every assignment concurrently and fill in the results.
///
/// Partial failure is tolerated: the call returns `Ok` as long as at least
/// one fragment succeeded. Failed assignments carry their error string so the
/// aggregator can degrade quality instead of guessing.
pub async fn distribute(
    assignments: Vec<ProviderAssignment>,
    fragments: &[Fragment],
    gateway: &dyn GenerateGateway,
    config: &PipelineConfig,
    request_id: Uuid,
    cancel: &CancellationToken,
) -> Result<Vec<ProviderAssignment>, DistributionError> {
    let total = assignments.len();
    if total == 0 {
        return Err(DistributionError::AllFailed(0));
    }

    let by_id: HashMap<&str, &Fragment> =
        fragments.iter().map(|f| (f.id.as_str(), f)).collect();
    let order: HashMap<&str, usize> =
        fragments.iter().map(|f| (f.id.as_str(), f.order)).collect();

    let timeout = config.fragment_timeout;
    let temperature = config.temperature;
    let max_tokens = config.max_tokens_per_fragment;

    let calls = assignments.into_iter().map(|mut assignment| {
        let fragment = by_id.get(assignment.fragment_id.as_str()).copied();
        async move {
            let Some(fragment) = fragment else {
                assignment.status = AssignmentStatus::Failed;
                assignment.error = Some("unknown fragment id".into());
                return assignment;
            };

            assignment.status = AssignmentStatus::InFlight;
            let mut req = GenerateRequest::new(
                assignment.provider_id.clone(),
                fragment.content.clone(),
                "distributor",
            )
            .temperature(temperature)
            .max_tokens(max_tokens)
            .request(request_id)
            .fragment(fragment.id.clone());
            if let Some(framing) = &fragment.framing {
                req = req.system(framing.clone());
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(CallError::Cancelled),
                r = tokio::time::timeout(timeout, gateway.generate(req)) => match r {
                    Ok(Ok(resp)) => Ok(resp),
                    Ok(Err(err)) => Err(CallError::Provider(err)),
                    Err(_) => Err(CallError::Timeout),
                },
            };
            assignment.latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(resp) => {
                    assignment.status = AssignmentStatus::Completed;
                    assignment.tokens_used = resp.tokens_used();
                    assignment.cost_nanodollars = resp.cost_nanodollars;
                    assignment.response = Some(resp.content);
                }
                Err(err) => {
                    assignment.status = AssignmentStatus::Failed;
                    assignment.error = Some(match err {
                        CallError::Cancelled => "cancelled".into(),
                        CallError::Timeout => "fragment deadline exceeded".into(),
                        CallError::Provider(e) => {
                            tracing::warn!(
                                request = %request_id,
                                fragment = %assignment.fragment_id,
                                provider = %assignment.provider_id,
                                error = %e,
                                "fragment dispatch failed"
                            );
                            e.to_string()
                        }
                    });
                }
            }
            assignment
        }
    });

    let mut results: Vec<ProviderAssignment> =
        stream::iter(calls).buffer_unordered(total).collect().await;

    if cancel.is_cancelled() {
        return Err(DistributionError::Cancelled);
    }

    // Responses arrive in completion order; put them back in fragment order.
    results.sort_by_key(|a| order.get(a.fragment_id.as_str()).copied().unwrap_or(usize::MAX));

    if results.iter().any(|a| a.succeeded()) {
        Ok(results)
    } else {
        Err(DistributionError::AllFailed(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::fragmenter::FragmentType;
    use crate::gateway::GenerateResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn frag(id: &str, order: usize, fragment_type: FragmentType) -> Fragment {
        Fragment {
            id: id.into(),
            order,
            content: format!("content of {id}"),
            fragment_type,
            context_refs: Vec::new(),
            provider_hint: None,
            framing: None,
        }
    }

    fn providers() -> Vec<ProviderProfile> {
        PipelineConfig::default().providers
    }

    #[test]
    fn sensitive_fragments_go_to_strict_providers() {
        let fragments = vec![
            frag("f1", 0, FragmentType::General),
            frag("f2", 1, FragmentType::Sensitive),
            frag("f3", 2, FragmentType::Pii),
        ];
        let providers = providers();
        let strict_ids: Vec<&str> = providers
            .iter()
            .filter(|p| p.strict_data_handling)
            .map(|p| p.id.as_str())
            .collect();

        let assignments = assign(&fragments, &providers, 2.0).unwrap();
        for a in assignments.iter().filter(|a| a.fragment_id != "f1") {
            assert!(strict_ids.contains(&a.provider_id.as_str()), "{a:?}");
        }
    }

    #[test]
    fn code_fragments_go_to_premium_tier() {
        let fragments = vec![frag("f1", 0, FragmentType::Code)];
        let providers = providers();
        let assignments = assign(&fragments, &providers, 2.0).unwrap();
        let assigned = providers
            .iter()
            .find(|p| p.id == assignments[0].provider_id)
            .unwrap();
        assert_eq!(assigned.cost_tier, CostTier::Premium);
    }

    #[test]
    fn general_fragments_spread_across_providers() {
        let fragments: Vec<Fragment> = (0..6)
            .map(|i| frag(&format!("f{i}"), i, FragmentType::General))
            .collect();
        let providers = providers();
        let assignments = assign(&fragments, &providers, 2.0).unwrap();

        let mut used: Vec<&str> = assignments.iter().map(|a| a.provider_id.as_str()).collect();
        used.sort();
        used.dedup();
        assert!(used.len() > 1, "all fragments went to one provider");
    }

    #[test]
    fn complex_queries_skip_economy_tier() {
        let fragments: Vec<Fragment> = (0..4)
            .map(|i| frag(&format!("f{i}"), i, FragmentType::General))
            .collect();
        let providers = providers();
        let assignments = assign(&fragments, &providers, 8.0).unwrap();
        for a in &assignments {
            let p = providers.iter().find(|p| p.id == a.provider_id).unwrap();
            assert!(p.cost_tier >= CostTier::Standard, "{a:?}");
        }
    }

    #[test]
    fn provider_hint_wins() {
        let mut f = frag("f1", 0, FragmentType::General);
        f.provider_hint = Some("anthropic".into());
        let assignments = assign(&[f], &providers(), 1.0).unwrap();
        assert_eq!(assignments[0].provider_id, "anthropic");
    }

    #[test]
    fn no_providers_is_an_error() {
        let fragments = vec![frag("f1", 0, FragmentType::General)];
        assert!(matches!(
            assign(&fragments, &[], 1.0),
            Err(DistributionError::NoProviders)
        ));
    }

    struct ScriptedGateway {
        fail_providers: Vec<String>,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn new(fail_providers: &[&str]) -> Self {
            Self {
                fail_providers: fail_providers.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl GenerateGateway for ScriptedGateway {
        async fn generate(
            &self,
            req: GenerateRequest,
        ) -> Result<GenerateResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_providers.contains(&req.provider_id) {
                return Err(ProviderError::unavailable(req.provider_id, "down"));
            }
            Ok(GenerateResponse {
                provider_id: req.provider_id.clone(),
                model: "scripted".into(),
                content: format!("answer for {}", req.fragment_id.unwrap_or_default()),
                input_tokens: 10,
                output_tokens: 20,
                cost_nanodollars: 1_000,
                latency: Duration::from_millis(5),
            })
        }
    }

    fn test_config() -> PipelineConfig {
        let mut c = PipelineConfig::default();
        c.fragment_timeout = Duration::from_secs(5);
        c
    }

    #[tokio::test]
    async fn distribute_fills_successful_assignments_in_order() {
        let fragments = vec![
            frag("f1", 0, FragmentType::General),
            frag("f2", 1, FragmentType::General),
        ];
        let config = test_config();
        let assignments = assign(&fragments, &config.providers, 1.0).unwrap();
        let gateway = ScriptedGateway::new(&[]);

        let results = distribute(
            assignments,
            &fragments,
            &gateway,
            &config,
            Uuid::new_v4(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].fragment_id, "f1");
        assert_eq!(results[1].fragment_id, "f2");
        for r in &results {
            assert!(r.succeeded());
            assert_eq!(r.tokens_used, 30);
            assert!(r.response.is_some());
        }
    }

    #[tokio::test]
    async fn partial_failure_still_succeeds() {
        let fragments = vec![
            frag("f1", 0, FragmentType::General),
            frag("f2", 1, FragmentType::General),
            frag("f3", 2, FragmentType::General),
        ];
        let config = test_config();
        let assignments = assign(&fragments, &config.providers, 1.0).unwrap();
        let failing = assignments[0].provider_id.clone();
        let gateway = ScriptedGateway::new(&[failing.as_str()]);

        let results = distribute(
            assignments,
            &fragments,
            &gateway,
            &config,
            Uuid::new_v4(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(results.iter().any(|a| a.succeeded()));
        assert!(results.iter().any(|a| !a.succeeded() && a.error.is_some()));
    }

    #[tokio::test]
    async fn framing_travels_as_the_system_message() {
        struct CaptureGateway {
            systems: std::sync::Mutex<Vec<Option<String>>>,
        }

        #[async_trait::async_trait]
        impl GenerateGateway for CaptureGateway {
            async fn generate(
                &self,
                req: GenerateRequest,
            ) -> Result<GenerateResponse, ProviderError> {
                self.systems.lock().unwrap().push(req.system.clone());
                Ok(GenerateResponse {
                    provider_id: req.provider_id,
                    model: "capture".into(),
                    content: "ok".into(),
                    input_tokens: 1,
                    output_tokens: 1,
                    cost_nanodollars: 1,
                    latency: Duration::from_millis(1),
                })
            }
        }

        let mut framed = frag("f1", 0, FragmentType::General);
        framed.framing = Some("part 1 of 2 of a larger request".into());
        let bare = frag("f2", 1, FragmentType::General);
        let fragments = vec![framed, bare];

        let config = test_config();
        let assignments = assign(&fragments, &config.providers, 1.0).unwrap();
        let gateway = CaptureGateway {
            systems: std::sync::Mutex::new(Vec::new()),
        };

        distribute(
            assignments,
            &fragments,
            &gateway,
            &config,
            Uuid::new_v4(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let systems = gateway.systems.lock().unwrap();
        assert!(systems
            .iter()
            .any(|s| s.as_deref() == Some("part 1 of 2 of a larger request")));
        assert!(systems.iter().any(|s| s.is_none()));
    }

    #[tokio::test]
    async fn all_failures_surface_as_distribution_error() {
        let fragments = vec![frag("f1", 0, FragmentType::General)];
        let config = test_config();
        let assignments = assign(&fragments, &config.providers, 1.0).unwrap();
        let gateway = ScriptedGateway::new(&["openai", "anthropic", "google"]);

        let err = distribute(
            assignments,
            &fragments,
            &gateway,
            &config,
            Uuid::new_v4(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DistributionError::AllFailed(1)));
    }

    #[tokio::test]
    async fn cancellation_aborts_distribution() {
        let fragments = vec![frag("f1", 0, FragmentType::General)];
        let config = test_config();
        let assignments = assign(&fragments, &config.providers, 1.0).unwrap();
        let gateway = ScriptedGateway::new(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = distribute(
            assignments,
            &fragments,
            &gateway,
            &config,
            Uuid::new_v4(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DistributionError::Cancelled));
    }
}
