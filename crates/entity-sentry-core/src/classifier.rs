//! Multi-jurisdiction classification orchestrator
//!
//! Construction loads every requested jurisdiction once, builds its analyzer,
//! and merges the group/threshold, display-name and validator indices
//! (last-writer-wins for entities present in several jurisdictions). The
//! per-request flow is a straight-line pipeline: detect across all analyzers,
//! sort, filter (decimal adjacency, unknown group, threshold, validators),
//! resolve overlaps, deduplicate, aggregate, and optionally anonymize. All
//! shared state is read-only after construction, so one classifier instance
//! can serve concurrent requests.

use crate::analyzer::{CountryAnalyzer, JurisdictionKind};
use crate::anonymizer;
use crate::config::{
    ClassificationRequest, ClassificationResponse, DetectionCandidate, JurisdictionConfig,
};
use crate::error::{ClassifierError, Result};
use crate::loader::ConfigLoader;
use crate::prompts::PromptProvider;
use crate::resolver::ConflictResolver;
use crate::textgen::TextGeneration;
use crate::validation::{self, EntityKind, RuleParams, ValidatorRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const UNKNOWN_GROUP: &str = "unknown";

/// Validator reference resolved for one entity at construction time.
#[derive(Debug, Clone)]
struct ValidatorBinding {
    jurisdiction: String,
    name: String,
    rules: RuleParams,
}

pub struct EntityClassifier {
    analyzers: Vec<CountryAnalyzer>,
    /// entity id -> (minimum confidence, group name)
    group_conf: HashMap<String, (f64, String)>,
    display_names: HashMap<String, String>,
    validator_index: HashMap<String, ValidatorBinding>,
    validators: Arc<ValidatorRegistry>,
    resolver: ConflictResolver,
    prompts: PromptProvider,
}

impl EntityClassifier {
    /// Build a classifier for the given jurisdictions. Missing or invalid
    /// configuration is fatal here; nothing later in the pipeline is.
    pub fn new(
        jurisdictions: &[String],
        loader: &ConfigLoader,
        textgen: Arc<dyn TextGeneration>,
    ) -> Result<Self> {
        let requested: Vec<String> = if jurisdictions.is_empty() {
            vec!["US".to_string()]
        } else {
            jurisdictions.to_vec()
        };

        let mut registry = ValidatorRegistry::with_builtins();
        let mut configs: Vec<Arc<JurisdictionConfig>> = Vec::new();
        for code in &requested {
            let config = Arc::new(loader.load(code)?);
            JurisdictionKind::for_code(&config.jurisdiction)
                .register_local_validators(&mut registry, &config.jurisdiction);
            configs.push(config);
        }
        let validators = Arc::new(registry);

        let mut group_conf = HashMap::new();
        let mut display_names = HashMap::new();
        let mut validator_index = HashMap::new();

        for config in &configs {
            for (entity_id, entity) in &config.entities {
                if !entity.enabled {
                    continue;
                }
                let group = if entity.group.trim().is_empty() {
                    UNKNOWN_GROUP.to_string()
                } else {
                    entity.group.clone()
                };
                group_conf.insert(entity_id.clone(), (entity.min_confidence(), group));
                if let Some(ref name) = entity.return_name {
                    display_names.insert(entity_id.clone(), name.clone());
                }
                if let Some(ref validator_name) = entity.validate_fn {
                    validator_index.insert(
                        entity_id.clone(),
                        ValidatorBinding {
                            jurisdiction: config.jurisdiction.clone(),
                            name: validator_name.clone(),
                            rules: entity.rules.clone(),
                        },
                    );
                }
            }
        }

        let prompts = PromptProvider::from_config(&configs[0]);
        let mut analyzers = Vec::with_capacity(configs.len());
        for config in configs {
            analyzers.push(CountryAnalyzer::new(
                config,
                Arc::clone(&textgen),
                Arc::clone(&validators),
            )?);
        }

        info!(
            "Classifier ready: {} jurisdiction(s), {} entities indexed",
            analyzers.len(),
            group_conf.len()
        );

        Ok(Self {
            analyzers,
            group_conf,
            display_names,
            validator_index,
            validators,
            resolver: ConflictResolver::new(textgen),
            prompts,
        })
    }

    /// Classify `request.text`, optionally anonymizing the accepted spans.
    pub async fn classify(&self, request: &ClassificationRequest) -> Result<ClassificationResponse> {
        if request.text.trim().is_empty() {
            return Err(ClassifierError::EmptyText);
        }

        let accepted = self.analyze_text(&request.text).await;

        if request.anonymize {
            let outcome = anonymizer::anonymize(&request.text, &accepted, &self.display_names);
            Ok(ClassificationResponse {
                entity_details: anonymizer::details_from_replacements(&outcome),
                data: Some(outcome.text),
            })
        } else {
            Ok(ClassificationResponse {
                data: None,
                entity_details: anonymizer::details_from_candidates(
                    &accepted,
                    &request.text,
                    &self.display_names,
                ),
            })
        }
    }

    /// Detection, filtering and overlap resolution for one text. Individual
    /// detector failures have already degraded to zero candidates; this
    /// method never fails.
    pub async fn analyze_text(&self, text: &str) -> Vec<DetectionCandidate> {
        let mut all: Vec<DetectionCandidate> = Vec::new();
        for analyzer in &self.analyzers {
            all.extend(analyzer.analyze(text, None).await);
        }
        all.sort_by_key(|c| (c.start, c.end));
        debug!("Collected {} raw candidate(s)", all.len());

        let mut accepted: Vec<DetectionCandidate> = Vec::new();
        for candidate in all {
            if self.accepts(text, &candidate) {
                accepted.push(candidate);
            }
        }

        let resolved = self
            .resolver
            .resolve(&self.prompts, text, accepted, &self.display_names)
            .await;

        let mut seen: HashSet<(String, usize, usize)> = HashSet::new();
        let mut unique: Vec<DetectionCandidate> = resolved
            .into_iter()
            .filter(|c| seen.insert(c.identity()))
            .collect();
        unique.sort_by_key(|c| (c.start, c.end));
        unique
    }

    /// The per-candidate filter chain, in order: span sanity, decimal
    /// adjacency for numeric kinds, group mapping, confidence threshold,
    /// configured validator, generic format validator.
    fn accepts(&self, text: &str, candidate: &DetectionCandidate) -> bool {
        let Some(value) = text.get(candidate.start..candidate.end) else {
            warn!(
                "Dropping '{}' with out-of-bounds span {}..{}",
                candidate.entity_id, candidate.start, candidate.end
            );
            return false;
        };

        let kind = self.entity_kind(&candidate.entity_id);
        if kind.is_numeric_like()
            && !validation::is_not_part_of_decimal(text, candidate.start, candidate.end)
        {
            debug!(
                "Dropping '{}' at {}..{}: embedded in a larger numeric literal",
                candidate.entity_id, candidate.start, candidate.end
            );
            return false;
        }

        let Some((min_confidence, group)) = self.group_conf.get(&candidate.entity_id) else {
            debug!("Dropping '{}': unmapped entity", candidate.entity_id);
            return false;
        };
        if group == UNKNOWN_GROUP {
            debug!("Dropping '{}': unknown group", candidate.entity_id);
            return false;
        }
        if candidate.confidence < *min_confidence {
            return false;
        }

        if let Some(binding) = self.validator_index.get(&candidate.entity_id) {
            let accepted = self.validators.validate(
                &binding.name,
                value,
                text,
                &binding.jurisdiction,
                &binding.rules,
            );
            if !accepted {
                debug!(
                    "Dropping '{}' at {}..{}: validator '{}' rejected",
                    candidate.entity_id, candidate.start, candidate.end, binding.name
                );
                return false;
            }
        }

        if !validation::validate_format_kind(kind, value, text, candidate.start, candidate.end) {
            debug!(
                "Dropping '{}' at {}..{}: format validation rejected",
                candidate.entity_id, candidate.start, candidate.end
            );
            return false;
        }

        true
    }

    /// Canonical kind for an entity id, falling back to its display name
    /// when the id itself is not a recognized label.
    fn entity_kind(&self, entity_id: &str) -> EntityKind {
        let kind = EntityKind::from_label(entity_id);
        if kind != EntityKind::Other {
            return kind;
        }
        self.display_names
            .get(entity_id)
            .map(|name| EntityKind::from_label(name))
            .unwrap_or(EntityKind::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::textgen::DisabledTextGeneration;

    fn classifier() -> EntityClassifier {
        EntityClassifier::new(
            &["US".to_string()],
            &ConfigLoader::new(),
            Arc::new(DisabledTextGeneration),
        )
        .unwrap()
    }

    #[test]
    fn test_construction_fails_for_unknown_jurisdiction() {
        let result = EntityClassifier::new(
            &["XX".to_string()],
            &ConfigLoader::new(),
            Arc::new(DisabledTextGeneration),
        );

        assert!(matches!(result, Err(ClassifierError::ConfigNotFound(_))));
    }

    #[test]
    fn test_empty_jurisdictions_default_to_us() {
        let classifier = EntityClassifier::new(
            &[],
            &ConfigLoader::new(),
            Arc::new(DisabledTextGeneration),
        )
        .unwrap();

        assert_eq!(classifier.analyzers.len(), 1);
        assert!(classifier.group_conf.contains_key("us-ssn"));
    }

    #[test]
    fn test_empty_text_is_a_request_error() {
        let classifier = classifier();
        let request = ClassificationRequest::new("   ");

        let result = tokio_test::block_on(classifier.classify(&request));
        assert!(matches!(result, Err(ClassifierError::EmptyText)));
    }

    #[test]
    fn test_decimal_fragment_is_rejected() {
        let classifier = classifier();
        let text = "Total: 1234567890.12";

        let candidate = DetectionCandidate::new("bank-account", 8, 17, 0.95);
        assert!(!classifier.accepts(text, &candidate));
    }

    #[test]
    fn test_unknown_entity_is_rejected_despite_confidence() {
        let classifier = classifier();
        let candidate = DetectionCandidate::new("never-configured", 0, 4, 1.0);

        assert!(!classifier.accepts("text", &candidate));
    }

    #[test]
    fn test_spans_stay_within_bounds() {
        let classifier = classifier();
        let text = "SSN 123-45-6789 and email john@test.com";

        let accepted = tokio_test::block_on(classifier.analyze_text(text));
        for candidate in &accepted {
            assert!(candidate.start < candidate.end);
            assert!(candidate.end <= text.len());
        }
    }

    #[test]
    fn test_last_writer_wins_across_jurisdictions() {
        let dir = tempfile::tempdir().unwrap();
        let override_doc = r#"
jurisdiction = "GLOBAL"

[entities.email]
group = "pii-contact"
return_name = "OVERRIDDEN_EMAIL"

[entities.email.detect]
methods = ["regex"]
min_confidence = 0.5

[[entities.email.detect.patterns]]
pattern = '\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b'
score = 0.85
"#;
        std::fs::write(dir.path().join("global.toml"), override_doc).unwrap();

        let loader = ConfigLoader::with_dir(dir.path());
        let classifier = EntityClassifier::new(
            &["US".to_string(), "GLOBAL".to_string()],
            &loader,
            Arc::new(DisabledTextGeneration),
        )
        .unwrap();

        // GLOBAL registered last, so its display name wins for the shared id.
        assert_eq!(
            classifier.display_names.get("email"),
            Some(&"OVERRIDDEN_EMAIL".to_string())
        );
    }
}
