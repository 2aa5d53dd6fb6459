//! Per-jurisdiction analyzers
//!
//! A [`CountryAnalyzer`] combines the regex detector registry, the LLM
//! detector and a post-filter (threshold + configured validator) into one
//! detection pass. Jurisdictions with bespoke behavior get their own
//! [`JurisdictionKind`] variant; everything else uses the default variant.

use crate::config::{DetectionCandidate, JurisdictionConfig};
use crate::detection::RegexDetectorRegistry;
use crate::error::Result;
use crate::llm::LlmDetector;
use crate::prompts::PromptProvider;
use crate::textgen::TextGeneration;
use crate::validation::{self, ValidatorRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Closed set of jurisdiction specializations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JurisdictionKind {
    Us,
    Default,
}

impl JurisdictionKind {
    pub fn for_code(code: &str) -> Self {
        match code.trim().to_uppercase().as_str() {
            "US" => Self::Us,
            _ => Self::Default,
        }
    }

    /// Register this jurisdiction's local validator functions under scoped
    /// keys. Local names shadow builtins of the same name for this
    /// jurisdiction only.
    pub fn register_local_validators(&self, registry: &mut ValidatorRegistry, jurisdiction: &str) {
        match self {
            Self::Us => {
                registry.register_scoped(jurisdiction, "validate_us_ssn", validation::validate_us_ssn);
                registry.register_scoped(
                    jurisdiction,
                    "validate_bank_account_number",
                    validation::validate_bank_account_number,
                );
                registry.register_scoped(
                    jurisdiction,
                    "validate_phone_number",
                    validation::validate_phone_number,
                );
                registry.register_scoped(jurisdiction, "validate_email", validation::validate_email);
                registry.register_scoped(
                    jurisdiction,
                    "validate_date_of_birth",
                    validation::validate_date_of_birth,
                );
            }
            Self::Default => {}
        }
    }
}

pub struct CountryAnalyzer {
    config: Arc<JurisdictionConfig>,
    kind: JurisdictionKind,
    regex_registry: RegexDetectorRegistry,
    llm_detector: LlmDetector,
    prompts: PromptProvider,
    validators: Arc<ValidatorRegistry>,
}

impl CountryAnalyzer {
    pub fn new(
        config: Arc<JurisdictionConfig>,
        textgen: Arc<dyn TextGeneration>,
        validators: Arc<ValidatorRegistry>,
    ) -> Result<Self> {
        let kind = JurisdictionKind::for_code(&config.jurisdiction);
        let regex_registry = RegexDetectorRegistry::from_config(&config)?;
        let prompts = PromptProvider::from_config(&config);
        let llm_detector = LlmDetector::new(Arc::clone(&config), textgen);

        Ok(Self {
            config,
            kind,
            regex_registry,
            llm_detector,
            prompts,
            validators,
        })
    }

    pub fn config(&self) -> &Arc<JurisdictionConfig> {
        &self.config
    }

    pub fn kind(&self) -> JurisdictionKind {
        self.kind
    }

    /// One full detection pass: regex + LLM, then the post-filter.
    pub async fn analyze(
        &self,
        text: &str,
        targets: Option<&HashSet<String>>,
    ) -> Vec<DetectionCandidate> {
        let mut candidates = self.regex_registry.detect(text);
        if let Some(targets) = targets {
            candidates.retain(|c| targets.contains(&c.entity_id));
        }

        let llm_candidates = self.llm_detector.detect(&self.prompts, text, targets).await;
        candidates.extend(llm_candidates);

        self.post_filter(text, candidates)
    }

    /// Enforce per-entity thresholds and configured validators on
    /// preliminary results.
    fn post_filter(&self, text: &str, candidates: Vec<DetectionCandidate>) -> Vec<DetectionCandidate> {
        let mut filtered = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let Some(entity) = self.config.entities.get(&candidate.entity_id) else {
                continue;
            };
            if !entity.enabled {
                continue;
            }
            if candidate.confidence < entity.min_confidence() {
                debug!(
                    "Dropping '{}' at {}..{}: confidence {:.2} below threshold {:.2}",
                    candidate.entity_id,
                    candidate.start,
                    candidate.end,
                    candidate.confidence,
                    entity.min_confidence()
                );
                continue;
            }
            if let Some(ref validator_name) = entity.validate_fn {
                let value = &text[candidate.start..candidate.end];
                let accepted = self.validators.validate(
                    validator_name,
                    value,
                    text,
                    &self.config.jurisdiction,
                    &entity.rules,
                );
                if !accepted {
                    debug!(
                        "Dropping '{}' at {}..{}: validator '{}' rejected",
                        candidate.entity_id, candidate.start, candidate.end, validator_name
                    );
                    continue;
                }
            }
            filtered.push(candidate);
        }

        filtered
    }
}
