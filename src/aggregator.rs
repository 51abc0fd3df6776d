//! Response aggregation: merge, de-anonymize and score.
//!
//! The aggregator is the only place placeholders are resolved back to their
//! originals; everything upstream of it works on redacted text. Scores are
//! heuristics for reporting, computed from what actually happened, and both
//! live in [0, 1].
//!
//! Privacy score: 1.0 when the query was never split (nothing sensitive was
//! found, so nothing was exposed beyond a normal single-provider call).
//! Otherwise `clamp(0.6 * isolation + 0.4 * diversity)` where isolation is
//! one minus the largest share of the query any single provider saw, and
//! diversity rewards spreading fragments over distinct providers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fragmenter::{Fragment, PlaceholderMap};
use crate::gateway::pricing;
use crate::planner::{FragmentationPlan, Strategy};
use crate::router::ProviderAssignment;

/// Actual fan-out spend vs. the hypothetical cost of sending the same token
/// volume to a single premium provider. Nanodollars throughout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostComparison {
    pub fragmented_cost_nanodollars: i64,
    pub single_provider_cost_nanodollars: i64,
    /// Positive when fragmenting was cheaper.
    pub savings_nanodollars: i64,
    pub providers_used: usize,
}

/// The de-anonymized answer with its metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub request_id: Uuid,
    pub response: String,
    pub strategy: Strategy,
    pub fragment_count: usize,
    pub providers_used: Vec<String>,
    pub privacy_score: f64,
    pub response_quality: f64,
    pub cost_comparison: CostComparison,
    /// True when some fragments failed and the answer is partial.
    pub degraded: bool,
    pub total_time_ms: u64,
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("no successful fragment responses to aggregate")]
    NothingToMerge,
}

/// Merge assignment responses into one answer and compute the metrics.
///
/// `assignments` must already be in fragment order; `distribute` guarantees
/// that. Failed assignments are skipped and degrade quality, never abort,
/// unless nothing at all succeeded.
pub fn aggregate(
    request_id: Uuid,
    fragments: &[Fragment],
    assignments: &[ProviderAssignment],
    placeholders: &PlaceholderMap,
    plan: &FragmentationPlan,
) -> Result<FinalResult, AggregationError> {
    let succeeded: Vec<&ProviderAssignment> =
        assignments.iter().filter(|a| a.succeeded()).collect();
    if succeeded.is_empty() {
        return Err(AggregationError::NothingToMerge);
    }

    let merged = succeeded
        .iter()
        .filter_map(|a| a.response.as_deref())
        .collect::<Vec<_>>()
        .join("\n\n");
    let response = placeholders.resolve(&merged);

    let mut providers_used: Vec<String> = succeeded
        .iter()
        .map(|a| a.provider_id.clone())
        .collect();
    providers_used.sort();
    providers_used.dedup();

    let privacy_score = privacy_score(fragments, assignments, plan);
    let response_quality = response_quality(assignments, &response);
    let cost_comparison = cost_comparison(assignments, providers_used.len());
    let degraded = succeeded.len() < assignments.len();

    Ok(FinalResult {
        request_id,
        response,
        strategy: plan.strategy,
        fragment_count: fragments.len(),
        providers_used,
        privacy_score,
        response_quality,
        cost_comparison,
        degraded,
        total_time_ms: 0,
    })
}

/// See the module docs for the formula.
pub fn privacy_score(
    fragments: &[Fragment],
    assignments: &[ProviderAssignment],
    plan: &FragmentationPlan,
) -> f64 {
    if plan.strategy == Strategy::None {
        return 1.0;
    }
    if fragments.is_empty() || assignments.is_empty() {
        return 0.0;
    }

    let total_bytes: usize = fragments.iter().map(|f| f.content.len()).sum();
    let total_bytes = total_bytes.max(1);

    // Largest share of the query content any single provider received.
    let mut per_provider: std::collections::HashMap<&str, usize> =
        std::collections::HashMap::new();
    for a in assignments {
        let bytes = fragments
            .iter()
            .find(|f| f.id == a.fragment_id)
            .map(|f| f.content.len())
            .unwrap_or(0);
        *per_provider.entry(a.provider_id.as_str()).or_insert(0) += bytes;
    }
    let max_share = per_provider
        .values()
        .map(|b| *b as f64 / total_bytes as f64)
        .fold(0.0_f64, f64::max);
    let isolation = 1.0 - max_share;

    let distinct = per_provider.len();
    let diversity = if assignments.len() > 1 {
        (distinct.saturating_sub(1)) as f64 / (assignments.len() - 1) as f64
    } else {
        0.0
    };

    (0.6 * isolation + 0.4 * diversity).clamp(0.0, 1.0)
}

/// Success ratio scaled by a mild length factor; partial failure always
/// scores below an all-success baseline.
pub fn response_quality(assignments: &[ProviderAssignment], response: &str) -> f64 {
    if assignments.is_empty() {
        return 0.0;
    }
    let succeeded = assignments.iter().filter(|a| a.succeeded()).count();
    let success_ratio = succeeded as f64 / assignments.len() as f64;
    let length_factor = (response.len() as f64 / 200.0).min(1.0);
    (success_ratio * (0.6 + 0.4 * length_factor)).clamp(0.0, 1.0)
}

fn cost_comparison(assignments: &[ProviderAssignment], providers_used: usize) -> CostComparison {
    let fragmented: i64 = assignments.iter().map(|a| a.cost_nanodollars).sum();
    let total_tokens: u32 = assignments.iter().map(|a| a.tokens_used).sum();
    // Assignments track combined tokens; assume an even input/output split
    // for the hypothetical single call.
    let single = pricing::premium_reference_cost(total_tokens / 2, total_tokens.div_ceil(2));
    CostComparison {
        fragmented_cost_nanodollars: fragmented,
        single_provider_cost_nanodollars: single,
        savings_nanodollars: single - fragmented,
        providers_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragmenter::FragmentType;
    use crate::router::AssignmentStatus;

    fn frag(id: &str, order: usize, content: &str) -> Fragment {
        Fragment {
            id: id.into(),
            order,
            content: content.into(),
            fragment_type: FragmentType::General,
            context_refs: Vec::new(),
            provider_hint: None,
            framing: None,
        }
    }

    fn done(fragment_id: &str, provider_id: &str, response: &str) -> ProviderAssignment {
        ProviderAssignment {
            fragment_id: fragment_id.into(),
            provider_id: provider_id.into(),
            status: AssignmentStatus::Completed,
            response: Some(response.into()),
            latency_ms: 10,
            tokens_used: 30,
            cost_nanodollars: 1_000,
            error: None,
        }
    }

    fn failed(fragment_id: &str, provider_id: &str) -> ProviderAssignment {
        ProviderAssignment {
            fragment_id: fragment_id.into(),
            provider_id: provider_id.into(),
            status: AssignmentStatus::Failed,
            response: None,
            latency_ms: 10,
            tokens_used: 0,
            cost_nanodollars: 0,
            error: Some("down".into()),
        }
    }

    fn plan(strategy: Strategy) -> FragmentationPlan {
        FragmentationPlan {
            strategy,
            estimated_fragment_count: 1,
            complexity_score: 1.0,
            decision_rationale: "test".into(),
        }
    }

    #[test]
    fn merges_in_fragment_order_and_resolves_placeholders() {
        use crate::detection::{PiiEntity, PiiEntityType};

        let mut map = PlaceholderMap::new();
        let token = map.insert(&PiiEntity {
            entity_type: PiiEntityType::Email,
            text: "a@b.co".into(),
            start: 0,
            end: 6,
            confidence: 0.95,
        });
        assert!(token.starts_with("[REDACTED_EMAIL_"));

        let fragments = vec![frag("f1", 0, "intro"), frag("f2", 1, &token)];
        let assignments = vec![
            done("f1", "openai", "first part"),
            done("f2", "anthropic", &format!("about {token} then")),
        ];
        let result = aggregate(
            Uuid::new_v4(),
            &fragments,
            &assignments,
            &map,
            &plan(Strategy::PiiIsolation),
        )
        .unwrap();

        assert_eq!(result.response, "first part\n\nabout a@b.co then");
        assert!(!result.degraded);
        assert_eq!(result.providers_used, vec!["anthropic", "openai"]);
    }

    #[test]
    fn none_strategy_scores_full_privacy() {
        let fragments = vec![frag("f1", 0, "whole query")];
        let assignments = vec![done("f1", "openai", "answer")];
        let score = privacy_score(&fragments, &assignments, &plan(Strategy::None));
        assert_eq!(score, 1.0);
    }

    #[test]
    fn privacy_score_in_bounds_and_rewards_diversity() {
        let fragments = vec![
            frag("f1", 0, "aaaaaaaaaa"),
            frag("f2", 1, "bbbbbbbbbb"),
            frag("f3", 2, "cccccccccc"),
        ];
        let spread = vec![
            done("f1", "openai", "x"),
            done("f2", "anthropic", "y"),
            done("f3", "google", "z"),
        ];
        let bunched = vec![
            done("f1", "openai", "x"),
            done("f2", "openai", "y"),
            done("f3", "openai", "z"),
        ];
        let p = plan(Strategy::PiiIsolation);
        let spread_score = privacy_score(&fragments, &spread, &p);
        let bunched_score = privacy_score(&fragments, &bunched, &p);

        assert!((0.0..=1.0).contains(&spread_score));
        assert!((0.0..=1.0).contains(&bunched_score));
        assert!(spread_score > bunched_score);
        // One provider holding everything is as bad as not splitting at all.
        assert_eq!(bunched_score, 0.0);
    }

    #[test]
    fn partial_failure_degrades_quality() {
        let fragments = vec![frag("f1", 0, "a"), frag("f2", 1, "b")];
        let map = PlaceholderMap::new();
        let p = plan(Strategy::SemanticSplit);

        let all_ok = vec![
            done("f1", "openai", "a long enough answer to not be penalized for brevity here"),
            done("f2", "anthropic", "another long enough answer that fills out the response"),
        ];
        let partial = vec![
            done("f1", "openai", "a long enough answer to not be penalized for brevity here"),
            failed("f2", "anthropic"),
        ];

        let full = aggregate(Uuid::new_v4(), &fragments, &all_ok, &map, &p).unwrap();
        let degraded = aggregate(Uuid::new_v4(), &fragments, &partial, &map, &p).unwrap();

        assert!(degraded.degraded);
        assert!(degraded.response_quality < full.response_quality);
    }

    #[test]
    fn zero_successes_is_an_error() {
        let fragments = vec![frag("f1", 0, "a")];
        let assignments = vec![failed("f1", "openai")];
        let map = PlaceholderMap::new();
        let err = aggregate(
            Uuid::new_v4(),
            &fragments,
            &assignments,
            &map,
            &plan(Strategy::PiiIsolation),
        )
        .unwrap_err();
        assert!(matches!(err, AggregationError::NothingToMerge));
    }

    #[test]
    fn cost_comparison_adds_up() {
        let fragments = vec![frag("f1", 0, "a"), frag("f2", 1, "b")];
        let assignments = vec![done("f1", "openai", "x"), done("f2", "google", "y")];
        let map = PlaceholderMap::new();
        let result = aggregate(
            Uuid::new_v4(),
            &fragments,
            &assignments,
            &map,
            &plan(Strategy::SemanticSplit),
        )
        .unwrap();

        assert_eq!(result.cost_comparison.fragmented_cost_nanodollars, 2_000);
        assert_eq!(result.cost_comparison.providers_used, 2);
        assert_eq!(
            result.cost_comparison.savings_nanodollars,
            result.cost_comparison.single_provider_cost_nanodollars - 2_000
        );
    }
}
