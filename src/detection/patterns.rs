//! Pattern passes for the built-in regex detector.
//!
//! Each entity type gets its own pass with a fixed confidence for matches;
//! validator checks (Luhn, octet ranges) gate the high-confidence paths.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{PiiEntity, PiiEntityType, Span};

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email regex")
});

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+\d{1,2}[\s.\-]?)?(?:\(\d{3}\)|\b\d{3})[\s.\-]\d{3}[\s.\-]\d{4}\b")
        .expect("phone regex")
});

static SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex"));

static CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d(?:[ \-]?\d){12,18}\b").expect("card regex"));

static IP_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ip regex"));

static API_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:sk|pk|rk|api|key|token|secret)[-_][A-Za-z0-9\-_]{16,}").expect("key regex")
});

// Name after an introduction phrase; the capture group is the entity.
static INTRODUCED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:[Mm]y name is|I am|I'm|[Tt]his is|[Cc]all me|[Rr]egards,|[Ss]incerely,)\s+([A-Z][a-z]+(?:\s[A-Z][a-z]+){0,2})",
    )
    .expect("name regex")
});

// Bare capitalized bigram: weak signal, stays below the Name threshold so it
// is discarded unless a stronger pass claims the same span.
static BARE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+\s[A-Z][a-z]+\b").expect("bare name regex"));

static ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b\d{1,5}\s+(?:[A-Z][A-Za-z]+\s+)+(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way)\b",
    )
    .expect("address regex")
});

static FENCED_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+#\-]*\r?\n.*?```").expect("fence regex")
});

static CODE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:fn |def |class |import |from .+ import|#include|function |const |let |var |public |private |return |if \(|for \(|while \()|[{};]\s*$",
    )
    .expect("code line regex")
});

/// Run every PII pass and return all candidates, thresholds not yet applied.
pub fn detect_pii_candidates(text: &str) -> Vec<PiiEntity> {
    let mut out = Vec::new();

    for m in EMAIL.find_iter(text) {
        out.push(entity(PiiEntityType::Email, text, m.start(), m.end(), 0.95));
    }

    for m in SSN.find_iter(text) {
        out.push(entity(PiiEntityType::Ssn, text, m.start(), m.end(), 0.9));
    }

    for m in PHONE.find_iter(text) {
        out.push(entity(PiiEntityType::Phone, text, m.start(), m.end(), 0.8));
    }

    for m in CARD.find_iter(text) {
        let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
        if (13..=19).contains(&digits.len()) && luhn_valid(&digits) {
            out.push(entity(
                PiiEntityType::CreditCard,
                text,
                m.start(),
                m.end(),
                0.95,
            ));
        }
    }

    for m in IP_ADDRESS.find_iter(text) {
        if m.as_str().split('.').all(|o| o.parse::<u16>().map_or(false, |n| n <= 255)) {
            out.push(entity(
                PiiEntityType::IpAddress,
                text,
                m.start(),
                m.end(),
                0.85,
            ));
        }
    }

    for m in API_KEY.find_iter(text) {
        out.push(entity(PiiEntityType::ApiKey, text, m.start(), m.end(), 0.9));
    }

    for caps in INTRODUCED_NAME.captures_iter(text) {
        if let Some(g) = caps.get(1) {
            out.push(entity(PiiEntityType::Name, text, g.start(), g.end(), 0.85));
        }
    }

    for m in BARE_NAME.find_iter(text) {
        out.push(entity(PiiEntityType::Name, text, m.start(), m.end(), 0.4));
    }

    for m in ADDRESS.find_iter(text) {
        out.push(entity(
            PiiEntityType::Address,
            text,
            m.start(),
            m.end(),
            0.75,
        ));
    }

    out
}

fn entity(
    entity_type: PiiEntityType,
    text: &str,
    start: usize,
    end: usize,
    confidence: f64,
) -> PiiEntity {
    PiiEntity {
        entity_type,
        text: text[start..end].to_string(),
        start,
        end,
        confidence,
    }
}

/// Luhn checksum for card number validation.
fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    let mut double = false;
    for c in digits.chars().rev() {
        let mut d = c.to_digit(10).unwrap_or(0);
        if double {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
        double = !double;
    }
    sum % 10 == 0
}

/// Detect code spans: fenced blocks first, then runs of code-looking lines
/// outside any fence.
pub fn detect_code_spans(text: &str) -> Vec<Span> {
    let mut spans: Vec<Span> = FENCED_CODE
        .find_iter(text)
        .map(|m| Span::new(m.start(), m.end()))
        .collect();

    // Heuristic pass: two or more consecutive code-looking lines.
    let mut run_start: Option<usize> = None;
    let mut run_lines = 0usize;
    let mut run_end = 0usize;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_end_matches('\n');

        let inside_fence = spans
            .iter()
            .any(|s| s.overlaps(&Span::new(line_start, line_start + line.len())));

        if !inside_fence && !trimmed.trim().is_empty() && CODE_LINE.is_match(trimmed) {
            if run_start.is_none() {
                run_start = Some(line_start);
                run_lines = 0;
            }
            run_lines += 1;
            run_end = line_start + trimmed.len();
        } else {
            if let Some(start) = run_start.take() {
                if run_lines >= 2 {
                    spans.push(Span::new(start, run_end));
                }
            }
        }
    }
    if let Some(start) = run_start {
        if run_lines >= 2 {
            spans.push(Span::new(start, run_end));
        }
    }

    spans.sort_by_key(|s| s.start);
    spans
}

/// Best-effort language guess from the fence tag or body keywords.
pub fn guess_code_language(text: &str, spans: &[Span]) -> Option<String> {
    for span in spans {
        let body = &text[span.start..span.end];
        if let Some(rest) = body.strip_prefix("```") {
            let tag: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '#' | '-'))
                .collect();
            if !tag.is_empty() {
                return Some(tag.to_lowercase());
            }
        }
        if body.contains("def ") || body.contains("import ") && body.contains(":") {
            return Some("python".into());
        }
        if body.contains("fn ") && body.contains("->") || body.contains("let mut") {
            return Some("rust".into());
        }
        if body.contains("function ") || body.contains("console.") || body.contains("=>") {
            return Some("javascript".into());
        }
        if body.contains("public class") || body.contains("System.out") {
            return Some("java".into());
        }
        if body.contains("#include") {
            return Some("c".into());
        }
    }
    None
}
