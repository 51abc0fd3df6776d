//! Query fragmentation: cut the query into provider-bound pieces.
//!
//! The fragmenter owns the only lossy-looking transformation in the pipeline
//! and keeps it reversible: every PII span is replaced by a placeholder token
//! and the token → original mapping lives in a [`PlaceholderMap`] that never
//! leaves the server side. Concatenating fragment contents in `order` and
//! resolving placeholders reproduces the original query byte for byte.

use std::collections::HashMap;

use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detection::{DetectionReport, PiiEntity, Span};
use crate::planner::{FragmentationPlan, Strategy};

// Split after . ! ? followed by whitespace; the whitespace stays attached to
// the preceding piece so concatenation is lossless.
static SENTENCE_BREAK: Lazy<FancyRegex> =
    Lazy::new(|| FancyRegex::new(r"(?<=[.!?])\s+").expect("sentence break regex"));

/// Kind of content a fragment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    General,
    Pii,
    Code,
    Sensitive,
}

impl FragmentType {
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Pii | Self::Sensitive)
    }
}

/// One provider-bound piece of the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    /// Unique within the request, e.g. "f3".
    pub id: String,
    /// Position for reassembly; contiguous from 0.
    pub order: usize,
    /// Exact slice of the query, with PII replaced by placeholder tokens.
    pub content: String,
    pub fragment_type: FragmentType,
    /// Ids of neighboring fragments whose high-level summaries this one may
    /// reference. Never raw content.
    pub context_refs: Vec<String>,
    /// Router may honor this; empty means no preference.
    pub provider_hint: Option<String>,
    /// Neutral framing attached by the enhancer; not part of the round-trip.
    pub framing: Option<String>,
}

/// Server-side mapping from placeholder token to original PII text.
///
/// Created here, consumed by the aggregator during de-anonymization, and
/// dropped with the request. Never serialized into provider-bound content.
/// Tokens carry a random per-request infix so that query text which happens
/// to look like a token cannot collide with a minted one.
#[derive(Debug)]
pub struct PlaceholderMap {
    nonce: String,
    entries: Vec<(String, String)>,
    counters: HashMap<&'static str, u32>,
}

impl Default for PlaceholderMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderMap {
    pub fn new() -> Self {
        use rand::Rng;
        Self {
            nonce: format!("{:06x}", rand::thread_rng().gen::<u32>() & 0xFF_FFFF),
            entries: Vec::new(),
            counters: HashMap::new(),
        }
    }

    /// Mint a token for an entity and remember the original text.
    pub fn insert(&mut self, entity: &PiiEntity) -> String {
        let label = entity.entity_type.label();
        let n = self.counters.entry(label).or_insert(0);
        *n += 1;
        let token = format!("[REDACTED_{label}_{}_{n}]", self.nonce);
        self.entries.push((token.clone(), entity.text.clone()));
        token
    }

    /// Replace every known token in `text` with its original value.
    pub fn resolve(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (token, original) in &self.entries {
            out = out.replace(token.as_str(), original);
        }
        out
    }

    pub fn original(&self, token: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, o)| o.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum FragmentationError {
    #[error("entity span {start}..{end} out of bounds for query of {len} bytes")]
    SpanOutOfBounds { start: usize, end: usize, len: usize },
    #[error("entity text does not match query slice at {start}..{end}")]
    SpanMismatch { start: usize, end: usize },
    #[error("overlapping spans at {0}..{1}")]
    OverlappingSpans(usize, usize),
}

enum Cut<'a> {
    Entity(&'a PiiEntity),
    Code(Span),
}

impl Cut<'_> {
    fn span(&self) -> Span {
        match self {
            Cut::Entity(e) => e.span(),
            Cut::Code(s) => *s,
        }
    }
}

/// Cut the query according to the plan.
///
/// Invariants: at least one fragment always; for [`Strategy::None`] exactly
/// one fragment holding the full query; fragment `order` is contiguous and
/// concatenation-plus-resolution reconstructs the original text.
pub fn fragment(
    query: &str,
    detection: &DetectionReport,
    plan: &FragmentationPlan,
) -> Result<(Vec<Fragment>, PlaceholderMap), FragmentationError> {
    let mut map = PlaceholderMap::new();

    let pieces = match plan.strategy {
        Strategy::None => vec![piece(query.to_string(), FragmentType::General)],
        Strategy::SemanticSplit => semantic_pieces(query),
        Strategy::PiiIsolation => {
            let cuts: Vec<Cut> = detection.pii_entities.iter().map(Cut::Entity).collect();
            cut_pieces(query, cuts, &mut map)?
        }
        Strategy::CodeIsolation => {
            let cuts: Vec<Cut> = detection.code_spans.iter().copied().map(Cut::Code).collect();
            cut_pieces(query, cuts, &mut map)?
        }
        Strategy::MaximumIsolation => {
            let mut cuts: Vec<Cut> = detection.pii_entities.iter().map(Cut::Entity).collect();
            cuts.extend(detection.code_spans.iter().copied().map(Cut::Code));
            cut_pieces(query, cuts, &mut map)?
        }
    };

    let mut fragments: Vec<Fragment> = pieces
        .into_iter()
        .enumerate()
        .map(|(i, (content, fragment_type))| Fragment {
            id: format!("f{}", i + 1),
            order: i,
            content,
            fragment_type,
            context_refs: Vec::new(),
            provider_hint: None,
            framing: None,
        })
        .collect();

    // Fragments may reference their neighbors' summaries, never raw content.
    let ids: Vec<String> = fragments.iter().map(|f| f.id.clone()).collect();
    for (i, frag) in fragments.iter_mut().enumerate() {
        if i > 0 {
            frag.context_refs.push(ids[i - 1].clone());
        }
        if i + 1 < ids.len() {
            frag.context_refs.push(ids[i + 1].clone());
        }
    }

    Ok((fragments, map))
}

fn piece(content: String, fragment_type: FragmentType) -> (String, FragmentType) {
    (content, fragment_type)
}

/// Walk the query start to end, emitting prose pieces between cuts and one
/// piece per cut. Prose runs are further split at sentence boundaries.
fn cut_pieces(
    query: &str,
    mut cuts: Vec<Cut>,
    map: &mut PlaceholderMap,
) -> Result<Vec<(String, FragmentType)>, FragmentationError> {
    cuts.sort_by_key(|c| c.span().start);

    for pair in cuts.windows(2) {
        let (a, b) = (pair[0].span(), pair[1].span());
        if a.overlaps(&b) {
            return Err(FragmentationError::OverlappingSpans(b.start, a.end));
        }
    }

    let mut pieces = Vec::new();
    let mut pos = 0usize;

    for cut in &cuts {
        let span = cut.span();
        if span.end > query.len() || span.is_empty() {
            return Err(FragmentationError::SpanOutOfBounds {
                start: span.start,
                end: span.end,
                len: query.len(),
            });
        }

        if span.start > pos {
            prose_pieces(&query[pos..span.start], &mut pieces);
        }

        match cut {
            Cut::Entity(entity) => {
                if &query[span.start..span.end] != entity.text {
                    return Err(FragmentationError::SpanMismatch {
                        start: span.start,
                        end: span.end,
                    });
                }
                let token = map.insert(entity);
                let fragment_type = if entity.entity_type.is_high_sensitivity() {
                    FragmentType::Sensitive
                } else {
                    FragmentType::Pii
                };
                pieces.push((token, fragment_type));
            }
            Cut::Code(_) => {
                pieces.push((query[span.start..span.end].to_string(), FragmentType::Code));
            }
        }
        pos = span.end;
    }

    if pos < query.len() {
        prose_pieces(&query[pos..], &mut pieces);
    }

    if pieces.is_empty() {
        pieces.push((query.to_string(), FragmentType::General));
    }

    Ok(pieces)
}

/// Split a prose run at sentence boundaries, losslessly. Short runs stay
/// whole; connective scraps between entities are kept verbatim so the
/// round-trip holds.
fn prose_pieces(text: &str, out: &mut Vec<(String, FragmentType)>) {
    if text.len() < 80 {
        out.push((text.to_string(), FragmentType::General));
        return;
    }
    for range in sentence_ranges(text) {
        out.push((text[range.0..range.1].to_string(), FragmentType::General));
    }
}

/// Byte ranges of sentence pieces covering the whole input with no gaps.
fn sentence_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut last = 0usize;

    let mut finder = SENTENCE_BREAK.find_iter(text);
    while let Some(Ok(m)) = finder.next() {
        // Trailing whitespace belongs to the preceding sentence.
        ranges.push((last, m.end()));
        last = m.end();
    }
    if last < text.len() || ranges.is_empty() {
        ranges.push((last, text.len()));
    }
    ranges
}

/// Group sentences into a handful of topic-sized pieces without redaction.
fn semantic_pieces(query: &str) -> Vec<(String, FragmentType)> {
    let ranges = sentence_ranges(query);
    if ranges.len() <= 1 {
        return vec![(query.to_string(), FragmentType::General)];
    }

    // Aim for up to three fragments of consecutive sentences.
    let per_group = ranges.len().div_ceil(3).max(1);
    let mut pieces = Vec::new();
    for group in ranges.chunks(per_group) {
        let start = group.first().map(|r| r.0).unwrap_or(0);
        let end = group.last().map(|r| r.1).unwrap_or(query.len());
        pieces.push((query[start..end].to_string(), FragmentType::General));
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Detector, RegexDetector};
    use crate::planner;
    use crate::planner::Strategy;
    use crate::Query;

    fn run(text: &str) -> (Vec<Fragment>, PlaceholderMap, FragmentationPlan) {
        let report = RegexDetector::new().detect(text).unwrap();
        let plan = planner::plan(&Query::new(text), &report);
        let (frags, map) = fragment(text, &report, &plan).unwrap();
        (frags, map, plan)
    }

    fn reconstruct(fragments: &[Fragment], map: &PlaceholderMap) -> String {
        let mut sorted: Vec<&Fragment> = fragments.iter().collect();
        sorted.sort_by_key(|f| f.order);
        let joined: String = sorted.iter().map(|f| f.content.as_str()).collect();
        map.resolve(&joined)
    }

    #[test]
    fn none_strategy_yields_single_fragment() {
        let (frags, map, plan) = run("What is the capital of France?");
        assert_eq!(plan.strategy, Strategy::None);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].content, "What is the capital of France?");
        assert!(map.is_empty());
    }

    #[test]
    fn pii_round_trip_is_exact() {
        let text = "My name is John Smith and my email is john.smith@example.com. \
                    What's a good password manager?";
        let (frags, map, plan) = run(text);
        assert_eq!(plan.strategy, Strategy::PiiIsolation);
        assert!(frags.len() >= 2);
        assert_eq!(reconstruct(&frags, &map), text);
    }

    #[test]
    fn no_fragment_carries_raw_pii() {
        let text = "My name is John Smith and my email is john.smith@example.com. \
                    What's a good password manager?";
        let (frags, _, _) = run(text);
        for frag in &frags {
            assert!(!frag.content.contains("john.smith@example.com"), "{}", frag.content);
            assert!(!frag.content.contains("John Smith"), "{}", frag.content);
        }
    }

    #[test]
    fn pii_fragments_hold_only_the_token() {
        let text = "My name is John Smith and my email is john.smith@example.com. \
                    What's a good password manager?";
        let (frags, map, _) = run(text);
        let pii: Vec<_> = frags
            .iter()
            .filter(|f| f.fragment_type == FragmentType::Pii)
            .collect();
        assert_eq!(pii.len(), 2);
        for frag in pii {
            assert!(frag.content.starts_with("[REDACTED_"));
            assert!(map.original(&frag.content).is_some());
        }
    }

    #[test]
    fn high_sensitivity_entities_become_sensitive_fragments() {
        let text = "My SSN is 123-45-6789, can I use it as a password seed?";
        let (frags, map, _) = run(text);
        assert!(frags
            .iter()
            .any(|f| f.fragment_type == FragmentType::Sensitive));
        assert_eq!(reconstruct(&frags, &map), text);
    }

    #[test]
    fn code_isolation_preserves_code_verbatim() {
        let text = "Why does this fail?\n```python\ndef add(a, b):\n    return a + b\n```\nThanks!";
        let (frags, map, plan) = run(text);
        assert_eq!(plan.strategy, Strategy::CodeIsolation);
        let code = frags
            .iter()
            .find(|f| f.fragment_type == FragmentType::Code)
            .unwrap();
        assert!(code.content.contains("def add"));
        assert_eq!(reconstruct(&frags, &map), text);
    }

    #[test]
    fn maximum_isolation_one_entity_per_fragment() {
        let text = "Email ops@example.com about the outage.\n\
                    ```python\ndef ping():\n    return True\n```\n\
                    My name is Jane Doe and my phone is 415-555-2671. \
                    Please summarize the incident for the team and suggest next steps.";
        let (frags, map, plan) = run(text);
        assert_eq!(plan.strategy, Strategy::MaximumIsolation);

        for frag in &frags {
            let placeholder_count = frag.content.matches("[REDACTED_").count();
            assert!(placeholder_count <= 1, "{}", frag.content);
        }
        assert_eq!(reconstruct(&frags, &map), text);
    }

    #[test]
    fn orders_are_contiguous_and_ids_unique() {
        let text = "My email is a@b.co and my other email is c@d.co. Which is better for work?";
        let (frags, _, _) = run(text);
        let mut ids: Vec<_> = frags.iter().map(|f| f.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), frags.len());
        for (i, f) in frags.iter().enumerate() {
            assert_eq!(f.order, i);
        }
    }

    #[test]
    fn duplicate_values_get_distinct_tokens() {
        let text = "Mail a@b.co today. Mail a@b.co again tomorrow so they notice the follow-up.";
        let report = RegexDetector::new().detect(text).unwrap();
        let plan = planner::plan(&Query::new(text), &report);
        let (frags, map) = fragment(text, &report, &plan).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(reconstruct(&frags, &map), text);
    }

    #[test]
    fn token_shaped_query_text_cannot_collide_with_minted_tokens() {
        // The user pasting something that looks like one of our tokens must
        // not be rewritten during de-anonymization.
        let text = "Someone sent me the string [REDACTED_EMAIL_1], what is it? \
                    My own email is real@example.com by the way.";
        let (frags, map, _) = run(text);
        assert_eq!(map.len(), 1);
        assert_eq!(reconstruct(&frags, &map), text);

        let minted: Vec<&Fragment> = frags
            .iter()
            .filter(|f| f.fragment_type == FragmentType::Pii)
            .collect();
        assert_eq!(minted.len(), 1);
        assert_ne!(minted[0].content, "[REDACTED_EMAIL_1]");
        assert_eq!(map.original(&minted[0].content), Some("real@example.com"));
    }

    #[test]
    fn sentence_ranges_cover_everything() {
        let text = "One sentence here. Another one! A third? Trailing words";
        let ranges = sentence_ranges(text);
        let glued: String = ranges.iter().map(|r| &text[r.0..r.1]).collect();
        assert_eq!(glued, text);
        assert_eq!(ranges.len(), 4);
    }
}
