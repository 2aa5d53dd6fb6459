//! Overlap grouping and arbitration
//!
//! Walks the confidence-accepted, start-sorted candidate stream and
//! partitions it into non-overlapping accepted results and ambiguous groups
//! (different entity types claiming intersecting spans). Ambiguous groups are
//! submitted to the text-generation judge; when arbitration fails, the group
//! falls back to its highest-confidence member rather than being dropped.

use crate::config::DetectionCandidate;
use crate::prompts::{JudgeCandidate, PromptProvider};
use crate::textgen::TextGeneration;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Two spans overlap when their half-open ranges intersect. The type
/// difference is a separate, independent check applied by the grouping walk.
pub fn spans_overlap(a: &DetectionCandidate, b: &DetectionCandidate) -> bool {
    !(a.end <= b.start || b.end <= a.start)
}

/// Partition a start-sorted stream into outright-accepted candidates and
/// ambiguous overlap groups awaiting arbitration.
///
/// A candidate overlapping the running group's last member is accepted
/// outright when it shares that member's entity type (same-type overlap is
/// not ambiguous) and joins the group otherwise. A non-overlapping candidate
/// flushes the group: singleton groups are accepted, larger ones become
/// arbitration work.
pub fn group_candidates(
    sorted: Vec<DetectionCandidate>,
) -> (Vec<DetectionCandidate>, Vec<Vec<DetectionCandidate>>) {
    let mut accepted: Vec<DetectionCandidate> = Vec::new();
    let mut groups: Vec<Vec<DetectionCandidate>> = Vec::new();
    let mut current: Vec<DetectionCandidate> = Vec::new();

    for candidate in sorted {
        if let Some(last) = current.last() {
            if spans_overlap(last, &candidate) {
                if last.entity_id == candidate.entity_id {
                    accepted.push(candidate);
                } else {
                    current.push(candidate);
                }
                continue;
            }
        }
        flush(&mut current, &mut accepted, &mut groups);
        current.push(candidate);
    }
    flush(&mut current, &mut accepted, &mut groups);

    (accepted, groups)
}

fn flush(
    current: &mut Vec<DetectionCandidate>,
    accepted: &mut Vec<DetectionCandidate>,
    groups: &mut Vec<Vec<DetectionCandidate>>,
) {
    match current.len() {
        0 => {}
        1 => accepted.push(current.pop().expect("len checked")),
        _ => groups.push(std::mem::take(current)),
    }
    current.clear();
}

#[derive(Debug, Deserialize)]
struct JudgeVerdicts {
    verdicts: Vec<JudgeVerdict>,
}

#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    index: usize,
    correct: bool,
}

pub struct ConflictResolver {
    textgen: Arc<dyn TextGeneration>,
}

impl ConflictResolver {
    pub fn new(textgen: Arc<dyn TextGeneration>) -> Self {
        Self { textgen }
    }

    /// Resolve all overlaps in a start-sorted candidate stream. Returns the
    /// accepted candidates; no two different-type results in the output
    /// overlap.
    pub async fn resolve(
        &self,
        prompts: &PromptProvider,
        text: &str,
        sorted: Vec<DetectionCandidate>,
        display_names: &HashMap<String, String>,
    ) -> Vec<DetectionCandidate> {
        let (mut accepted, groups) = group_candidates(sorted);
        if groups.is_empty() {
            return accepted;
        }
        info!("Arbitrating {} ambiguous overlap group(s)", groups.len());

        for group in groups {
            let winners = self.arbitrate(prompts, text, &group, display_names).await;
            accepted.extend(winners);
        }
        accepted
    }

    async fn arbitrate(
        &self,
        prompts: &PromptProvider,
        text: &str,
        group: &[DetectionCandidate],
        display_names: &HashMap<String, String>,
    ) -> Vec<DetectionCandidate> {
        let judge_candidates: Vec<JudgeCandidate> = group
            .iter()
            .enumerate()
            .map(|(index, c)| JudgeCandidate {
                index,
                entity_type: display_names
                    .get(&c.entity_id)
                    .cloned()
                    .unwrap_or_else(|| c.entity_id.clone()),
                value: text[c.start..c.end].to_string(),
                start: c.start,
                end: c.end,
            })
            .collect();

        let messages = prompts.judge_messages(text, &judge_candidates);
        let response = self.textgen.generate_entity(&messages).await;

        let verdicts = response.and_then(|raw| {
            serde_json::from_value::<JudgeVerdicts>(raw)
                .map_err(|e| debug!("Judge verdicts failed to parse: {}", e))
                .ok()
        });

        match verdicts {
            Some(parsed) if !parsed.verdicts.is_empty() => parsed
                .verdicts
                .iter()
                .filter(|v| v.correct)
                .filter_map(|v| group.get(v.index).cloned())
                .collect(),
            _ => {
                warn!(
                    "Arbitration unavailable for group of {}, keeping highest confidence",
                    group.len()
                );
                highest_confidence(group).into_iter().collect()
            }
        }
    }
}

/// Deterministic arbitration fallback: highest confidence wins, ties broken
/// by earliest start, then entity id order.
fn highest_confidence(group: &[DetectionCandidate]) -> Option<DetectionCandidate> {
    group
        .iter()
        .min_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then(a.start.cmp(&b.start))
                .then(a.entity_id.cmp(&b.entity_id))
        })
        .cloned()
}
