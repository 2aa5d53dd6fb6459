//! Anonymization and response aggregation
//!
//! Replaces accepted spans with a stable per-entity placeholder token and
//! reports every replacement's span in the redacted text. Placeholder length
//! differs from the original value, so each new span already reflects the
//! cumulative length delta introduced by prior replacements. Response
//! aggregation turns accepted candidates (or replacements) into
//! [`EntityDetailRecord`]s grouped by display entity type.

use crate::config::{DetectionCandidate, EntityDetailRecord};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One placeholder substitution, located in the redacted text.
#[derive(Debug, Clone)]
pub struct SpanReplacement {
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct AnonymizationOutcome {
    pub text: String,
    pub replacements: Vec<SpanReplacement>,
}

/// Placeholder token for an entity type, stable per type.
pub fn placeholder_for(entity_type: &str) -> String {
    format!("<{}>", entity_type)
}

fn display_for<'a>(
    display_names: &'a HashMap<String, String>,
    entity_id: &'a str,
) -> &'a str {
    display_names
        .get(entity_id)
        .map(String::as_str)
        .unwrap_or(entity_id)
}

/// Replace each accepted span with its placeholder. `candidates` must be
/// sorted by start offset; a candidate beginning inside an already-replaced
/// region is skipped.
pub fn anonymize(
    text: &str,
    candidates: &[DetectionCandidate],
    display_names: &HashMap<String, String>,
) -> AnonymizationOutcome {
    let mut redacted = String::with_capacity(text.len());
    let mut replacements = Vec::with_capacity(candidates.len());
    let mut cursor = 0usize;

    for candidate in candidates {
        if candidate.start < cursor {
            debug!(
                "Skipping '{}' at {}..{}: span already replaced",
                candidate.entity_id, candidate.start, candidate.end
            );
            continue;
        }
        let Some(prefix) = text.get(cursor..candidate.start) else {
            continue;
        };
        if text.get(candidate.start..candidate.end).is_none() {
            continue;
        }

        redacted.push_str(prefix);
        let entity_type = display_for(display_names, &candidate.entity_id).to_string();
        let token = placeholder_for(&entity_type);
        let new_start = redacted.len();
        redacted.push_str(&token);
        replacements.push(SpanReplacement {
            entity_type,
            start: new_start,
            end: new_start + token.len(),
            confidence: candidate.confidence,
        });
        cursor = candidate.end;
    }
    redacted.push_str(&text[cursor.min(text.len())..]);

    AnonymizationOutcome {
        text: redacted,
        replacements,
    }
}

/// Detail records for a plain (non-anonymized) response, grouped by display
/// entity type. `candidates` must be sorted by start offset.
pub fn details_from_candidates(
    candidates: &[DetectionCandidate],
    text: &str,
    display_names: &HashMap<String, String>,
) -> BTreeMap<String, Vec<EntityDetailRecord>> {
    let mut details: BTreeMap<String, Vec<EntityDetailRecord>> = BTreeMap::new();

    for candidate in candidates {
        let Some(value) = text.get(candidate.start..candidate.end) else {
            continue;
        };
        let entity_type = display_for(display_names, &candidate.entity_id).to_string();
        details.entry(entity_type).or_default().push(EntityDetailRecord {
            location: format!("{}_{}", candidate.start, candidate.end),
            confidence_score: candidate.confidence,
            entity_value: value.to_string(),
            start_index: candidate.start,
            end_index: candidate.end,
        });
    }
    details
}

/// Detail records for an anonymized response: locations and values refer to
/// the redacted text.
pub fn details_from_replacements(
    outcome: &AnonymizationOutcome,
) -> BTreeMap<String, Vec<EntityDetailRecord>> {
    let mut details: BTreeMap<String, Vec<EntityDetailRecord>> = BTreeMap::new();

    for replacement in &outcome.replacements {
        let Some(value) = outcome.text.get(replacement.start..replacement.end) else {
            continue;
        };
        details
            .entry(replacement.entity_type.clone())
            .or_default()
            .push(EntityDetailRecord {
                location: format!("{}_{}", replacement.start, replacement.end),
                confidence_score: replacement.confidence,
                entity_value: value.to_string(),
                start_index: replacement.start,
                end_index: replacement.end,
            });
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display_names() -> HashMap<String, String> {
        let mut names = HashMap::new();
        names.insert("us-ssn".to_string(), "US_SSN".to_string());
        names.insert("date-of-birth".to_string(), "DATE_OF_BIRTH".to_string());
        names
    }

    #[test]
    fn test_single_replacement() {
        let text = "SSN 123-45-6789 end";
        let candidates = vec![DetectionCandidate::new("us-ssn", 4, 15, 0.9)];

        let outcome = anonymize(text, &candidates, &display_names());

        assert_eq!(outcome.text, "SSN <US_SSN> end");
        assert_eq!(outcome.replacements.len(), 1);
        let r = &outcome.replacements[0];
        assert_eq!(&outcome.text[r.start..r.end], "<US_SSN>");
    }

    #[test]
    fn test_offsets_shift_by_actual_length_delta() {
        let text = "born 05/15/1990, SSN 123-45-6789";
        let candidates = vec![
            DetectionCandidate::new("date-of-birth", 5, 15, 0.85),
            DetectionCandidate::new("us-ssn", 21, 32, 0.9),
        ];

        let outcome = anonymize(text, &candidates, &display_names());

        assert_eq!(outcome.text, "born <DATE_OF_BIRTH>, SSN <US_SSN>");
        // "<DATE_OF_BIRTH>" is 15 chars replacing a 10-char date, so the SSN
        // placeholder lands 5 bytes later than the original span.
        let ssn = &outcome.replacements[1];
        assert_eq!(&outcome.text[ssn.start..ssn.end], "<US_SSN>");
        assert_eq!(ssn.start, 26);
    }

    #[test]
    fn test_contained_span_is_skipped() {
        let text = "value 123456789012 end";
        let candidates = vec![
            DetectionCandidate::new("us-ssn", 6, 18, 0.9),
            DetectionCandidate::new("date-of-birth", 10, 16, 0.8),
        ];

        let outcome = anonymize(text, &candidates, &display_names());

        assert_eq!(outcome.replacements.len(), 1);
        assert_eq!(outcome.text, "value <US_SSN> end");
    }

    #[test]
    fn test_details_from_candidates_grouped_and_located() {
        let text = "SSN 123-45-6789 end";
        let candidates = vec![DetectionCandidate::new("us-ssn", 4, 15, 0.9)];

        let details = details_from_candidates(&candidates, text, &display_names());

        let records = &details["US_SSN"];
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].location, "4_15");
        assert_eq!(records[0].entity_value, "123-45-6789");
        assert_eq!(records[0].start_index, 4);
        assert_eq!(records[0].end_index, 15);
    }

    #[test]
    fn test_details_from_replacements_use_redacted_spans() {
        let text = "born 05/15/1990, SSN 123-45-6789";
        let candidates = vec![
            DetectionCandidate::new("date-of-birth", 5, 15, 0.85),
            DetectionCandidate::new("us-ssn", 21, 32, 0.9),
        ];
        let outcome = anonymize(text, &candidates, &display_names());

        let details = details_from_replacements(&outcome);

        let ssn = &details["US_SSN"][0];
        assert_eq!(ssn.entity_value, "<US_SSN>");
        assert_eq!(
            &outcome.text[ssn.start_index..ssn.end_index],
            "<US_SSN>"
        );
    }

    #[test]
    fn test_unmapped_entity_uses_its_id() {
        let text = "x 12345 y";
        let candidates = vec![DetectionCandidate::new("mystery", 2, 7, 0.5)];

        let outcome = anonymize(text, &candidates, &HashMap::new());
        assert_eq!(outcome.text, "x <mystery> y");
    }
}
