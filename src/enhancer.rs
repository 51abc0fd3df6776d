//! Context enhancement: neutral framing so providers answer fragments well.
//!
//! Each fragment may get a short framing sentence telling the provider what
//! kind of piece it is looking at. Framing is category-level only. It never
//! contains another fragment's content, any placeholder original, or anything
//! identifying, and it lives outside `content` so reassembly stays exact.

use crate::fragmenter::{Fragment, FragmentType};
use crate::planner::{self, FragmentationPlan, Strategy};

/// Attach framing to each fragment in place. No-op when the query was not
/// split at all.
pub fn enhance(fragments: &mut [Fragment], plan: &FragmentationPlan) {
    if fragments.len() <= 1 || plan.strategy == Strategy::None {
        return;
    }

    let total = fragments.len();
    for fragment in fragments.iter_mut() {
        fragment.framing = Some(framing_for(fragment, total));
    }
}

fn framing_for(fragment: &Fragment, total: usize) -> String {
    let position = format!("part {} of {} of a larger request", fragment.order + 1, total);

    match fragment.fragment_type {
        FragmentType::Code => format!(
            "You are reviewing a code excerpt, {position}. \
             Answer only about this excerpt."
        ),
        FragmentType::Pii | FragmentType::Sensitive => format!(
            "This is {position}. It contains an anonymized reference token; \
             treat it as an opaque identifier and do not speculate about it."
        ),
        FragmentType::General => {
            let topic = planner::dominant_topic(&fragment.content);
            match topic {
                Some(topic) => format!(
                    "This is {position}, on the topic of {topic}. \
                     Answer it on its own, without asking about missing context."
                ),
                None => format!(
                    "This is {position}. Answer it on its own, \
                     without asking about missing context."
                ),
            }
        }
    }
}
