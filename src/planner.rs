//! Fragmentation planning: pick a strategy and estimate query complexity.
//!
//! The planner is pure and deterministic. It looks only at the query text and
//! the detection report, never at provider state, so the same input always
//! produces the same plan.
//!
//! Complexity formula, bounded to [0, 10] and monotonic in token count,
//! topic count and question count:
//!
//! ```text
//! score = min(10, min(tokens / 40, 4) + min(1.5 * topics, 4) + min(0.5 * questions, 2))
//! ```

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::detection::DetectionReport;
use crate::Query;

static BPE: Lazy<CoreBPE> = Lazy::new(|| cl100k_base().expect("cl100k_base tokenizer"));

/// Keyword buckets for the topic heuristic. A bucket counts once no matter
/// how many of its keywords appear.
static TOPIC_LEXICON: &[(&str, &[&str])] = &[
    (
        "programming",
        &["code", "function", "compile", "debug", "python", "rust", "javascript", "api", "bug", "error message"],
    ),
    (
        "finance",
        &["invest", "stock", "budget", "loan", "mortgage", "tax", "salary", "bank", "credit"],
    ),
    (
        "health",
        &["doctor", "symptom", "medication", "diagnosis", "therapy", "diet", "exercise", "sleep"],
    ),
    (
        "legal",
        &["contract", "lawsuit", "attorney", "lawyer", "liability", "copyright", "license agreement"],
    ),
    (
        "travel",
        &["flight", "hotel", "itinerary", "visa", "passport", "vacation", "airport"],
    ),
    (
        "science",
        &["experiment", "hypothesis", "molecule", "physics", "chemistry", "biology", "quantum"],
    ),
    (
        "cooking",
        &["recipe", "ingredient", "bake", "roast", "simmer", "oven", "marinade"],
    ),
    (
        "sports",
        &["match", "tournament", "league", "training plan", "marathon", "workout"],
    ),
];

/// How the query gets cut up, ordered here from least to most protective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    None,
    SemanticSplit,
    CodeIsolation,
    PiiIsolation,
    MaximumIsolation,
}

impl Strategy {
    /// Rank for hint comparison. A hint is honored only when it is at least
    /// as protective as the planner's own choice.
    pub fn protectiveness(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::SemanticSplit => 1,
            Self::CodeIsolation => 2,
            Self::PiiIsolation => 3,
            Self::MaximumIsolation => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SemanticSplit => "semantic_split",
            Self::CodeIsolation => "code_isolation",
            Self::PiiIsolation => "pii_isolation",
            Self::MaximumIsolation => "maximum_isolation",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "semantic_split" => Ok(Self::SemanticSplit),
            "code_isolation" => Ok(Self::CodeIsolation),
            "pii_isolation" => Ok(Self::PiiIsolation),
            "maximum_isolation" => Ok(Self::MaximumIsolation),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Output of the planning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentationPlan {
    pub strategy: Strategy,
    /// Rough fragment count for progress reporting; the fragmenter decides
    /// the real number.
    pub estimated_fragment_count: usize,
    /// Bounded [0, 10].
    pub complexity_score: f64,
    /// Human-readable reason, reporting only.
    pub decision_rationale: String,
}

/// Pick a strategy for the query. Decision table, first match wins.
pub fn plan(query: &Query, report: &DetectionReport) -> FragmentationPlan {
    let text = query.text.as_str();

    if text.trim().is_empty() {
        return FragmentationPlan {
            strategy: Strategy::None,
            estimated_fragment_count: 1,
            complexity_score: 0.0,
            decision_rationale: "empty query".into(),
        };
    }

    let complexity = complexity_score(text);
    let topics = topic_count(text);

    let (mut strategy, mut rationale) = if report.has_pii && report.has_code {
        (
            Strategy::MaximumIsolation,
            format!(
                "{} pii entities and {} code spans detected",
                report.pii_entities.len(),
                report.code_spans.len()
            ),
        )
    } else if report.has_pii {
        (
            Strategy::PiiIsolation,
            format!("{} pii entities detected", report.pii_entities.len()),
        )
    } else if report.has_code {
        (
            Strategy::CodeIsolation,
            format!("{} code spans detected", report.code_spans.len()),
        )
    } else if complexity >= 5.0 && topics >= 2 {
        (
            Strategy::SemanticSplit,
            format!("complexity {complexity:.1} across {topics} topics, nothing sensitive"),
        )
    } else {
        (
            Strategy::None,
            format!("nothing sensitive, complexity {complexity:.1}"),
        )
    };

    // A high privacy level never leaves the full query with one provider.
    if query.privacy_level == Some(crate::PrivacyLevel::High) && strategy == Strategy::None {
        strategy = Strategy::SemanticSplit;
        rationale = "high privacy level requested, splitting anyway".into();
    }

    if let Some(hint) = query.strategy_hint {
        if hint.protectiveness() >= strategy.protectiveness() {
            rationale = format!("caller hint {hint} (would have chosen {strategy})");
            strategy = hint;
        }
    }

    FragmentationPlan {
        estimated_fragment_count: estimate_fragments(strategy, report),
        strategy,
        complexity_score: complexity,
        decision_rationale: rationale,
    }
}

/// Complexity in [0, 10]; see the module docs for the formula.
pub fn complexity_score(text: &str) -> f64 {
    if text.trim().is_empty() {
        return 0.0;
    }
    let tokens = BPE.encode_with_special_tokens(text).len() as f64;
    let topics = topic_count(text) as f64;
    let questions = text.matches('?').count() as f64;

    let score = (tokens / 40.0).min(4.0) + (1.5 * topics).min(4.0) + (0.5 * questions).min(2.0);
    score.min(10.0)
}

/// Number of distinct lexicon buckets the text touches.
pub fn topic_count(text: &str) -> usize {
    let lower = text.to_lowercase();
    TOPIC_LEXICON
        .iter()
        .filter(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .count()
}

/// Bucket with the most keyword hits, used for neutral framing.
pub fn dominant_topic(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    TOPIC_LEXICON
        .iter()
        .map(|(name, words)| (*name, words.iter().filter(|w| lower.contains(*w)).count()))
        .filter(|(_, hits)| *hits > 0)
        .max_by_key(|(_, hits)| *hits)
        .map(|(name, _)| name)
}

fn estimate_fragments(strategy: Strategy, report: &DetectionReport) -> usize {
    match strategy {
        Strategy::None => 1,
        Strategy::SemanticSplit => 3,
        Strategy::PiiIsolation => report.pii_entities.len() + 2,
        Strategy::CodeIsolation => report.code_spans.len() + 2,
        Strategy::MaximumIsolation => {
            report.pii_entities.len() + report.code_spans.len() + 2
        }
    }
}
