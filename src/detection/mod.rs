//! Sensitive-content detection: PII entities and code spans.
//!
//! The pipeline consumes detection through the [`Detector`] trait so an
//! external NER engine can be dropped in; [`RegexDetector`] is the built-in
//! implementation, pattern passes per entity type with fixed acceptance
//! thresholds. Detection is deterministic: the same input always yields the
//! same report.

pub mod patterns;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte range into the original query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Kinds of personally identifiable information the detector recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiEntityType {
    Name,
    Email,
    Phone,
    Ssn,
    Address,
    CreditCard,
    IpAddress,
    ApiKey,
}

impl PiiEntityType {
    /// Label used in placeholder tokens, e.g. the `EMAIL` in
    /// `[REDACTED_EMAIL_3f9a2c_1]`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Name => "NAME",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Ssn => "SSN",
            Self::Address => "ADDRESS",
            Self::CreditCard => "CREDIT_CARD",
            Self::IpAddress => "IP_ADDRESS",
            Self::ApiKey => "API_KEY",
        }
    }

    /// Entities whose exposure is damaging on its own, even out of context.
    pub fn is_high_sensitivity(&self) -> bool {
        matches!(self, Self::Ssn | Self::CreditCard | Self::ApiKey)
    }

    /// Fixed acceptance threshold per entity type. Candidates below the
    /// threshold are discarded, never returned with low confidence.
    pub fn confidence_threshold(&self) -> f64 {
        match self {
            Self::Name => 0.6,
            Self::Email => 0.5,
            Self::Phone => 0.5,
            Self::Ssn => 0.5,
            Self::Address => 0.5,
            Self::CreditCard => 0.5,
            Self::IpAddress => 0.5,
            Self::ApiKey => 0.5,
        }
    }
}

/// One detected PII entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiEntity {
    pub entity_type: PiiEntityType,
    /// The matched text, verbatim.
    pub text: String,
    /// Byte offset of the match start in the original query.
    pub start: usize,
    /// Byte offset one past the match end.
    pub end: usize,
    /// Detector confidence in [0, 1].
    pub confidence: f64,
}

impl PiiEntity {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// Everything the detector found in one pass over the query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionReport {
    pub has_pii: bool,
    pub pii_entities: Vec<PiiEntity>,
    pub has_code: bool,
    pub code_language: Option<String>,
    pub code_spans: Vec<Span>,
}

impl DetectionReport {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether anything sensitive (PII or code) was found.
    pub fn has_sensitive_content(&self) -> bool {
        self.has_pii || self.has_code
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detection engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("detection produced out-of-bounds span {start}..{end} for input of {len} bytes")]
    SpanOutOfBounds { start: usize, end: usize, len: usize },
}

/// Seam for the detection engine. Implementations must be deterministic
/// for a given input and tolerate empty or very short strings.
pub trait Detector: Send + Sync {
    fn detect(&self, text: &str) -> Result<DetectionReport, DetectionError>;
}

/// Built-in detector: per-type regex/validator passes with overlap
/// resolution. No network, no model weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexDetector;

impl RegexDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Detector for RegexDetector {
    fn detect(&self, text: &str) -> Result<DetectionReport, DetectionError> {
        if text.trim().is_empty() {
            return Ok(DetectionReport::empty());
        }

        let code_spans = patterns::detect_code_spans(text);
        let code_language = if code_spans.is_empty() {
            None
        } else {
            patterns::guess_code_language(text, &code_spans)
        };

        let mut candidates = patterns::detect_pii_candidates(text);

        // Threshold filter: sub-threshold candidates are dropped entirely.
        candidates.retain(|e| e.confidence >= e.entity_type.confidence_threshold());

        // PII touching a code span is isolated by the code fragment anyway,
        // and keeping it would produce overlapping cuts downstream.
        candidates.retain(|e| {
            let span = e.span();
            !code_spans.iter().any(|c| c.overlaps(&span))
        });

        // Cross-type overlap resolution: keep the most confident match,
        // ties broken by longer span, then earlier start.
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (b.end - b.start).cmp(&(a.end - a.start)))
                .then_with(|| a.start.cmp(&b.start))
        });

        let mut kept: Vec<PiiEntity> = Vec::new();
        for cand in candidates {
            if cand.end > text.len() || cand.start >= cand.end {
                return Err(DetectionError::SpanOutOfBounds {
                    start: cand.start,
                    end: cand.end,
                    len: text.len(),
                });
            }
            if !kept.iter().any(|k| k.span().overlaps(&cand.span())) {
                kept.push(cand);
            }
        }
        kept.sort_by_key(|e| e.start);

        Ok(DetectionReport {
            has_pii: !kept.is_empty(),
            pii_entities: kept,
            has_code: !code_spans.is_empty(),
            code_language,
            code_spans,
        })
    }
}
