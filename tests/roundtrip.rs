//! Round-trip and isolation properties of detection + fragmentation.

use veilsplit::detection::{Detector, RegexDetector};
use veilsplit::fragmenter::{self, Fragment, PlaceholderMap};
use veilsplit::planner;
use veilsplit::{Query, Strategy};

const QUERIES: &[&str] = &[
    "What is the capital of France?",
    "My name is John Smith and my email is john.smith@example.com. \
     What's a good password manager?",
    "Call me at 415-555-2671 or write to jane@corp.example about the invoice. \
     Also, is this deductible on my taxes?",
    "My SSN is 123-45-6789 and my card is 4111 1111 1111 1111. \
     Which one should I give to the hotel?",
    "Why does this fail?\n```python\ndef add(a, b):\n    return a + b\n```\nThanks!",
    "I live at 12 Baker Street and my server is 10.0.0.12. \
     ```\ncurl -H 'x-key: sk-abcdefghijklmnop1234' https://api.internal\n```\n\
     Can you write a firewall rule for it?",
    "Compare mortgage rates against stock returns for my retirement budget. \
     Then outline a training plan for a marathon. Then suggest a recipe that \
     freezes well. What should I tackle first?",
    "",
    "   ",
    "no punctuation no capitals no secrets just words",
];

fn fragment(text: &str) -> (Vec<Fragment>, PlaceholderMap, Strategy) {
    let report = RegexDetector::new().detect(text).unwrap();
    let plan = planner::plan(&Query::new(text), &report);
    let (frags, map) = fragmenter::fragment(text, &report, &plan).unwrap();
    (frags, map, plan.strategy)
}

#[test]
fn every_query_reconstructs_exactly() {
    for text in QUERIES {
        let (mut frags, map, strategy) = fragment(text);
        frags.sort_by_key(|f| f.order);
        let joined: String = frags.iter().map(|f| f.content.as_str()).collect();
        assert_eq!(
            map.resolve(&joined),
            *text,
            "round trip broke under {strategy}"
        );
    }
}

#[test]
fn no_fragment_carries_a_raw_pii_value() {
    for text in QUERIES {
        let report = RegexDetector::new().detect(text).unwrap();
        let plan = planner::plan(&Query::new(*text), &report);
        if plan.strategy == Strategy::None || plan.strategy == Strategy::SemanticSplit {
            continue;
        }
        let (frags, _) = fragmenter::fragment(text, &report, &plan).unwrap();

        for entity in &report.pii_entities {
            for frag in &frags {
                assert!(
                    !frag.content.contains(&entity.text),
                    "fragment {} leaks {:?} from {text:?}",
                    frag.id,
                    entity.text
                );
                if let Some(framing) = &frag.framing {
                    assert!(!framing.contains(&entity.text));
                }
            }
        }
    }
}

#[test]
fn at_most_one_placeholder_per_fragment_under_maximum_isolation() {
    let text = "My name is Jane Doe, email jane@corp.example, phone 415-555-2671.\n\
                ```python\nprint('hi')\n```\n\
                Summarize my exposure, please.";
    let report = RegexDetector::new().detect(text).unwrap();
    let plan = planner::plan(&Query::new(text), &report);
    assert_eq!(plan.strategy, Strategy::MaximumIsolation);

    let (frags, _) = fragmenter::fragment(text, &report, &plan).unwrap();
    for frag in &frags {
        assert!(
            frag.content.matches("[REDACTED_").count() <= 1,
            "{}: {}",
            frag.id,
            frag.content
        );
    }
}

#[test]
fn detection_and_planning_are_deterministic() {
    for text in QUERIES {
        let detector = RegexDetector::new();
        let a = detector.detect(text).unwrap();
        let b = detector.detect(text).unwrap();
        assert_eq!(a.pii_entities, b.pii_entities);
        assert_eq!(a.code_spans, b.code_spans);

        let plan_a = planner::plan(&Query::new(*text), &a);
        let plan_b = planner::plan(&Query::new(*text), &b);
        assert_eq!(plan_a.strategy, plan_b.strategy);
        assert_eq!(plan_a.complexity_score, plan_b.complexity_score);
    }
}

#[test]
fn there_is_always_at_least_one_fragment() {
    for text in QUERIES {
        let (frags, _, _) = fragment(text);
        assert!(!frags.is_empty(), "{text:?} produced no fragments");
    }
}

#[test]
fn placeholder_tokens_are_unique_per_request() {
    let text = "Mail a@b.co and c@d.co, then call 415-555-2671 about 555-867-5309 today.";
    let (frags, map, _) = fragment(text);
    assert!(map.len() >= 3);

    let mut tokens: Vec<&str> = frags
        .iter()
        .filter(|f| f.content.starts_with("[REDACTED_"))
        .map(|f| f.content.as_str())
        .collect();
    let before = tokens.len();
    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), before);
}
