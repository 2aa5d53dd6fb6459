//! Jurisdiction configuration model and shared classifier types

use crate::error::ClassifierError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Default confidence floor applied when an entity declares no threshold.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.6;

/// Default score attached to a regex pattern that declares none.
pub const DEFAULT_PATTERN_SCORE: f64 = 0.5;

/// Per-jurisdiction entity catalogue, loaded once and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JurisdictionConfig {
    pub jurisdiction: String,
    #[serde(default = "default_true")]
    pub seed_builtin_detectors: bool,
    #[serde(default)]
    pub enhancer: EnhancerSettings,
    #[serde(default)]
    pub llm: Option<LlmPromptDefaults>,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Category this entity aggregates under. Entities without a known group
    /// are invisible to downstream aggregation.
    pub group: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub detect: DetectSettings,
    /// Display-name override used in responses (e.g. `us-ssn` -> `US_SSN`).
    #[serde(default)]
    pub return_name: Option<String>,
    /// Validator reference: a builtin name, a jurisdiction-local function
    /// name, or a dotted fully-qualified name.
    #[serde(default)]
    pub validate_fn: Option<String>,
    /// Free-form rule parameters handed to the validator.
    #[serde(default)]
    pub rules: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub llm: Option<LlmEntityHints>,
    /// Context keywords that boost regex confidence and document the entity
    /// in LLM prompts.
    #[serde(default)]
    pub context: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectSettings {
    /// Detection methods; unknown names are dropped during deserialization
    /// rather than rejected.
    #[serde(default, deserialize_with = "deserialize_methods")]
    pub methods: Vec<DetectionMethod>,
    #[serde(default)]
    pub patterns: Vec<RegexPatternDef>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Builtin,
    Regex,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexPatternDef {
    pub pattern: String,
    #[serde(default = "default_pattern_score")]
    pub score: f64,
}

/// Tuning for the context-aware confidence enhancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancerSettings {
    #[serde(default = "default_similarity_factor")]
    pub similarity_factor: f64,
    #[serde(default = "default_min_score_with_context")]
    pub min_score_with_context: f64,
}

impl Default for EnhancerSettings {
    fn default() -> Self {
        Self {
            similarity_factor: default_similarity_factor(),
            min_score_with_context: default_min_score_with_context(),
        }
    }
}

/// Per-entity hints injected into the batched LLM detection prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmEntityHints {
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Jurisdiction-level prompt template defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmPromptDefaults {
    #[serde(default)]
    pub detection: PromptTemplate,
    #[serde(default)]
    pub judge: PromptTemplate,
}

/// A system/user template pair. `{entities_doc}`, `{output_json_schema}` and
/// `{text}` placeholders are substituted at prompt-build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub user_template: String,
}

fn default_true() -> bool {
    true
}

fn default_pattern_score() -> f64 {
    DEFAULT_PATTERN_SCORE
}

fn default_similarity_factor() -> f64 {
    0.35
}

fn default_min_score_with_context() -> f64 {
    0.4
}

fn deserialize_methods<'de, D>(deserializer: D) -> Result<Vec<DetectionMethod>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    Ok(raw
        .iter()
        .filter_map(|name| match name.as_str() {
            "builtin" => Some(DetectionMethod::Builtin),
            "regex" => Some(DetectionMethod::Regex),
            "llm" => Some(DetectionMethod::Llm),
            _ => None,
        })
        .collect())
}

impl EntityDefinition {
    pub fn has_method(&self, method: DetectionMethod) -> bool {
        self.detect.methods.contains(&method)
    }

    pub fn min_confidence(&self) -> f64 {
        self.detect.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE)
    }

    /// Key the LLM must emit for this entity; defaults to the entity id
    /// uppercased with `-` mapped to `_` (`us-ssn` -> `US_SSN`).
    pub fn output_key(&self, entity_id: &str) -> String {
        self.llm
            .as_ref()
            .and_then(|llm| llm.output_key.clone())
            .unwrap_or_else(|| entity_id.replace('-', "_").to_uppercase())
    }

    pub fn display_name(&self, entity_id: &str) -> String {
        self.return_name
            .clone()
            .unwrap_or_else(|| entity_id.to_string())
    }
}

impl JurisdictionConfig {
    pub fn from_toml_str(contents: &str, jurisdiction: &str) -> crate::error::Result<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| ClassifierError::InvalidConfig {
            jurisdiction: jurisdiction.to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        for (entity_id, entity) in &self.entities {
            for def in &entity.detect.patterns {
                regex::Regex::new(&def.pattern).map_err(|e| ClassifierError::InvalidPattern {
                    entity: entity_id.clone(),
                    source: e,
                })?;
            }
            if let Some(min) = entity.detect.min_confidence {
                if !(0.0..=1.0).contains(&min) {
                    return Err(ClassifierError::InvalidConfig {
                        jurisdiction: self.jurisdiction.clone(),
                        reason: format!(
                            "min_confidence for '{}' must be between 0.0 and 1.0",
                            entity_id
                        ),
                    });
                }
            }
        }
        if !(0.0..=1.0).contains(&self.enhancer.similarity_factor)
            || !(0.0..=1.0).contains(&self.enhancer.min_score_with_context)
        {
            return Err(ClassifierError::InvalidConfig {
                jurisdiction: self.jurisdiction.clone(),
                reason: "enhancer factors must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }

    /// Entity ids eligible for the LLM detection pass, in stable order.
    pub fn llm_entity_ids(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter(|(_, e)| e.enabled && e.has_method(DetectionMethod::Llm))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// A single detected (entity, span, confidence) triple. Spans are half-open,
/// 0-indexed byte offsets into the original text. Candidates are never
/// mutated, only filtered or replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionCandidate {
    pub entity_id: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

impl DetectionCandidate {
    pub fn new(entity_id: impl Into<String>, start: usize, end: usize, confidence: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            start,
            end,
            confidence,
        }
    }

    /// Identity key used for final deduplication.
    pub fn identity(&self) -> (String, usize, usize) {
        (self.entity_id.clone(), self.start, self.end)
    }
}

/// One reported entity occurrence in the response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDetailRecord {
    pub location: String,
    pub confidence_score: f64,
    pub entity_value: String,
    pub start_index: usize,
    pub end_index: usize,
}

/// Classification request consumed from the API layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationRequest {
    pub text: String,
    #[serde(default)]
    pub anonymize: bool,
    #[serde(default = "default_jurisdictions")]
    pub jurisdictions: Vec<String>,
}

fn default_jurisdictions() -> Vec<String> {
    vec!["US".to_string()]
}

impl ClassificationRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            anonymize: false,
            jurisdictions: default_jurisdictions(),
        }
    }
}

/// Classification response produced for the API layer. `data` carries the
/// redacted text only when anonymization was requested.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "entityDetails")]
    pub entity_details: BTreeMap<String, Vec<EntityDetailRecord>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
jurisdiction = "US"

[entities.us-ssn]
group = "pii-identification"
context = ["ssn", "social security"]

[entities.us-ssn.detect]
methods = ["regex", "llm", "bogus"]
min_confidence = 0.3

[[entities.us-ssn.detect.patterns]]
pattern = '\b\d{3}-\d{2}-\d{4}\b'
score = 0.6
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = JurisdictionConfig::from_toml_str(MINIMAL, "US").unwrap();

        assert_eq!(config.jurisdiction, "US");
        assert!(config.seed_builtin_detectors);
        let entity = &config.entities["us-ssn"];
        assert!(entity.enabled);
        assert_eq!(entity.group, "pii-identification");
        assert_eq!(entity.detect.patterns.len(), 1);
        assert_eq!(entity.min_confidence(), 0.3);
    }

    #[test]
    fn test_unknown_methods_are_dropped() {
        let config = JurisdictionConfig::from_toml_str(MINIMAL, "US").unwrap();
        let entity = &config.entities["us-ssn"];

        assert_eq!(
            entity.detect.methods,
            vec![DetectionMethod::Regex, DetectionMethod::Llm]
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let bad = r#"
jurisdiction = "US"

[entities.broken]
group = "misc"

[entities.broken.detect]
methods = ["regex"]

[[entities.broken.detect.patterns]]
pattern = '['
"#;
        assert!(JurisdictionConfig::from_toml_str(bad, "US").is_err());
    }

    #[test]
    fn test_threshold_range_enforced() {
        let bad = r#"
jurisdiction = "US"

[entities.x]
group = "misc"

[entities.x.detect]
methods = ["regex"]
min_confidence = 1.5
"#;
        assert!(JurisdictionConfig::from_toml_str(bad, "US").is_err());
    }

    #[test]
    fn test_output_key_defaults_to_upper_snake() {
        let config = JurisdictionConfig::from_toml_str(MINIMAL, "US").unwrap();
        let entity = &config.entities["us-ssn"];

        assert_eq!(entity.output_key("us-ssn"), "US_SSN");
    }

    #[test]
    fn test_llm_entity_ids_respects_methods() {
        let config = JurisdictionConfig::from_toml_str(MINIMAL, "US").unwrap();

        assert_eq!(config.llm_entity_ids(), vec!["us-ssn".to_string()]);
    }

    #[test]
    fn test_request_defaults() {
        let req: ClassificationRequest = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();

        assert!(!req.anonymize);
        assert_eq!(req.jurisdictions, vec!["US".to_string()]);
    }
}
