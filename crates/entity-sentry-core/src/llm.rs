//! LLM-assisted detection
//!
//! Issues one batched detection call covering all LLM-eligible entities of a
//! jurisdiction, then maps the returned value strings back onto spans in the
//! source text. Candidates carry a fixed conservative confidence and are
//! adjudicated later by thresholding. Any failure degrades to zero candidates.

use crate::config::{DetectionCandidate, JurisdictionConfig};
use crate::prompts::PromptProvider;
use crate::textgen::TextGeneration;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Confidence attached to every LLM-derived candidate. Deliberately below a
/// perfect regex match so thresholds can arbitrate.
pub const LLM_DETECTION_CONFIDENCE: f64 = 0.8;

pub struct LlmDetector {
    config: Arc<JurisdictionConfig>,
    textgen: Arc<dyn TextGeneration>,
}

impl LlmDetector {
    pub fn new(config: Arc<JurisdictionConfig>, textgen: Arc<dyn TextGeneration>) -> Self {
        Self { config, textgen }
    }

    /// Run one batched detection pass over `text`. `targets` optionally
    /// restricts the prompted entity ids.
    pub async fn detect(
        &self,
        prompts: &PromptProvider,
        text: &str,
        targets: Option<&HashSet<String>>,
    ) -> Vec<DetectionCandidate> {
        let mut entity_ids = self.config.llm_entity_ids();
        if let Some(targets) = targets {
            entity_ids.retain(|id| targets.contains(id));
        }
        if entity_ids.is_empty() {
            return Vec::new();
        }

        let messages = prompts.detection_messages(&self.config, text, &entity_ids);
        let Some(raw) = self.textgen.generate_entity(&messages).await else {
            debug!("LLM detection produced no output");
            return Vec::new();
        };
        let Some(object) = raw.as_object() else {
            warn!("LLM detection returned non-object JSON, ignoring");
            return Vec::new();
        };

        let spans = map_values_to_spans(object, text, &self.config);
        info!("LLM detection resolved {} span(s)", spans.len());

        spans
            .into_iter()
            .map(|(entity_id, start, end)| {
                DetectionCandidate::new(entity_id, start, end, LLM_DETECTION_CONFIDENCE)
            })
            .collect()
    }
}

/// Map output-key -> extracted-values JSON onto `(entity_id, start, end)`
/// spans. Values that cannot be found in `text`, or whose span overlaps one
/// already claimed within this pass, are skipped.
pub fn map_values_to_spans(
    raw: &serde_json::Map<String, Value>,
    text: &str,
    config: &JurisdictionConfig,
) -> Vec<(String, usize, usize)> {
    let mut key_to_entity: HashMap<String, String> = HashMap::new();
    for (entity_id, entity) in &config.entities {
        if !entity.enabled {
            continue;
        }
        key_to_entity.insert(entity.output_key(entity_id), entity_id.clone());
    }

    let mut results: Vec<(String, usize, usize)> = Vec::new();
    let mut used: Vec<(usize, usize)> = Vec::new();

    for (output_key, values) in raw {
        let Some(entity_id) = key_to_entity.get(output_key) else {
            debug!("Unknown output key '{}' in LLM response", output_key);
            continue;
        };
        let Some(values) = values.as_array() else {
            continue;
        };

        for value in values {
            let Some(value) = value.as_str() else {
                continue;
            };
            if value.trim().is_empty() {
                continue;
            }
            let Some(start) = text.find(value) else {
                debug!("Extracted value '{}' not present in text", value);
                continue;
            };
            let end = start + value.len();
            if used.iter().any(|&(s, e)| spans_overlap((start, end), (s, e))) {
                continue;
            }
            used.push((start, end));
            results.push((entity_id.clone(), start, end));
        }
    }

    results
}

fn spans_overlap(a: (usize, usize), b: (usize, usize)) -> bool {
    !(a.1 <= b.0 || b.1 <= a.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ConfigLoader;
    use crate::prompts::PromptProvider;
    use crate::textgen::Message;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticBackend(Option<Value>);

    #[async_trait]
    impl TextGeneration for StaticBackend {
        async fn generate_entity(&self, _messages: &[Message]) -> Option<Value> {
            self.0.clone()
        }

        async fn generate(&self, _messages: &[Message]) -> Option<String> {
            self.0.as_ref().map(|v| v.to_string())
        }
    }

    fn us_config() -> Arc<JurisdictionConfig> {
        Arc::new(ConfigLoader::new().load("US").unwrap())
    }

    #[test]
    fn test_values_map_to_first_occurrence() {
        let config = us_config();
        let text = "SSN 123-45-6789 appears, then 123-45-6789 again";
        let raw = json!({"US_SSN": ["123-45-6789", "123-45-6789"]});

        let spans = map_values_to_spans(raw.as_object().unwrap(), text, &config);

        // Duplicate values resolve to the same first occurrence; the second
        // is dropped by the in-pass overlap rule.
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].0, "us-ssn");
        assert_eq!(&text[spans[0].1..spans[0].2], "123-45-6789");
    }

    #[test]
    fn test_unfound_values_are_skipped() {
        let config = us_config();
        let raw = json!({"US_SSN": ["999-99-9999"]});

        let spans = map_values_to_spans(raw.as_object().unwrap(), "nothing here", &config);
        assert!(spans.is_empty());
    }

    #[test]
    fn test_unknown_keys_are_skipped() {
        let config = us_config();
        let raw = json!({"NOT_AN_ENTITY": ["data"]});

        let spans = map_values_to_spans(raw.as_object().unwrap(), "data", &config);
        assert!(spans.is_empty());
    }

    #[test]
    fn test_overlapping_claims_within_pass_are_skipped() {
        let config = us_config();
        let text = "number 123-45-6789 here";
        let raw = json!({
            "US_SSN": ["123-45-6789"],
            "PHONE_NUMBER": ["123-45-6789"]
        });

        let spans = map_values_to_spans(raw.as_object().unwrap(), text, &config);
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn test_detector_resolves_candidates() {
        let config = us_config();
        let prompts = PromptProvider::from_config(&config);
        let backend = Arc::new(StaticBackend(Some(json!({
            "US_SSN": ["123-45-6789"]
        }))));
        let detector = LlmDetector::new(config, backend);

        let candidates = tokio_test::block_on(detector.detect(
            &prompts,
            "SSN 123-45-6789",
            None,
        ));

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].entity_id, "us-ssn");
        assert_eq!(candidates[0].confidence, LLM_DETECTION_CONFIDENCE);
    }

    #[test]
    fn test_backend_failure_degrades_to_empty() {
        let config = us_config();
        let prompts = PromptProvider::from_config(&config);
        let detector = LlmDetector::new(config, Arc::new(StaticBackend(None)));

        let candidates =
            tokio_test::block_on(detector.detect(&prompts, "SSN 123-45-6789", None));
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_non_object_response_degrades_to_empty() {
        let config = us_config();
        let prompts = PromptProvider::from_config(&config);
        let detector = LlmDetector::new(
            config,
            Arc::new(StaticBackend(Some(json!(["not", "an", "object"])))),
        );

        let candidates =
            tokio_test::block_on(detector.detect(&prompts, "SSN 123-45-6789", None));
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_empty_target_set_skips_the_call() {
        let config = us_config();
        let prompts = PromptProvider::from_config(&config);
        let detector = LlmDetector::new(
            config,
            Arc::new(StaticBackend(Some(json!({"US_SSN": ["123-45-6789"]})))),
        );

        let targets: HashSet<String> = HashSet::new();
        let candidates = tokio_test::block_on(detector.detect(
            &prompts,
            "SSN 123-45-6789",
            Some(&targets),
        ));

        assert!(candidates.is_empty());
    }
}
