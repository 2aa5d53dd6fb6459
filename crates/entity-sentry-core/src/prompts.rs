//! Prompt composition for detection and arbitration calls
//!
//! Detection prompts are batched: one system message documenting every
//! LLM-eligible entity with an output-key JSON schema in stable config order,
//! one user message carrying the text. Jurisdiction documents may override
//! the templates; `{entities_doc}`, `{output_json_schema}`, `{text}` and
//! `{candidates}` are the supported placeholders.

use crate::config::{JurisdictionConfig, PromptTemplate};
use crate::textgen::Message;
use serde::Serialize;

/// One member of an overlap group as presented to the judge.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeCandidate {
    pub index: usize,
    pub entity_type: String,
    pub value: String,
    pub start: usize,
    pub end: usize,
}

const DEFAULT_USER_TEMPLATE: &str = "**Sentence:** {text}";

const DEFAULT_JUDGE_SYSTEM: &str = "You are an arbitration engine for entity classification. \
Several detectors claimed overlapping spans of the same text with different entity types; \
at most one interpretation per span is correct. Judge each candidate against the surrounding text.\n\n\
Respond with exactly one JSON object of the form:\n\
{\"verdicts\": [{\"index\": 0, \"correct\": true}]}\n\
Include one verdict per candidate index.";

const DEFAULT_JUDGE_USER_TEMPLATE: &str = "TEXT: {text}\nCANDIDATES: {candidates}";

pub struct PromptProvider {
    detection: PromptTemplate,
    judge: PromptTemplate,
}

impl PromptProvider {
    pub fn from_config(config: &JurisdictionConfig) -> Self {
        let defaults = config.llm.clone().unwrap_or_default();
        Self {
            detection: defaults.detection,
            judge: defaults.judge,
        }
    }

    /// Batched detection messages for the given entity ids (stable order).
    pub fn detection_messages(
        &self,
        config: &JurisdictionConfig,
        text: &str,
        entity_ids: &[String],
    ) -> Vec<Message> {
        let schema_json = output_schema(config, entity_ids);
        let entities_doc = entities_doc(config, entity_ids);

        let system = if self.detection.system.is_empty() {
            format!(
                "## Entities\n{}\n\n## Output JSON Schema\n{}",
                entities_doc, schema_json
            )
        } else {
            self.detection
                .system
                .replace("{entities_doc}", &entities_doc)
                .replace("{output_json_schema}", &schema_json)
        };

        let user_template = if self.detection.user_template.is_empty() {
            DEFAULT_USER_TEMPLATE
        } else {
            &self.detection.user_template
        };

        vec![
            Message::system(system.trim()),
            Message::user(user_template.replace("{text}", text)),
        ]
    }

    /// Arbitration messages for one overlap group.
    pub fn judge_messages(&self, text: &str, candidates: &[JudgeCandidate]) -> Vec<Message> {
        let candidates_json =
            serde_json::to_string(candidates).unwrap_or_else(|_| "[]".to_string());

        let system = if self.judge.system.is_empty() {
            DEFAULT_JUDGE_SYSTEM.to_string()
        } else {
            self.judge.system.clone()
        };
        let user_template = if self.judge.user_template.is_empty() {
            DEFAULT_JUDGE_USER_TEMPLATE
        } else {
            &self.judge.user_template
        };

        vec![
            Message::system(system),
            Message::user(
                user_template
                    .replace("{text}", text)
                    .replace("{candidates}", &candidates_json),
            ),
        ]
    }
}

/// JSON schema block `{ "KEY": [""], ... }` in the order of `entity_ids`.
fn output_schema(config: &JurisdictionConfig, entity_ids: &[String]) -> String {
    let mut lines = vec!["{".to_string()];
    for (i, entity_id) in entity_ids.iter().enumerate() {
        let Some(entity) = config.entities.get(entity_id) else {
            continue;
        };
        let comma = if i < entity_ids.len() - 1 { "," } else { "" };
        lines.push(format!(
            "  \"{}\": [\"\"]{}",
            entity.output_key(entity_id),
            comma
        ));
    }
    lines.push("}".to_string());
    lines.join("\n")
}

/// Markdown documentation block for the prompted entities: description,
/// context indicators, examples and notes, one bullet group per entity.
fn entities_doc(config: &JurisdictionConfig, entity_ids: &[String]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for entity_id in entity_ids {
        let Some(entity) = config.entities.get(entity_id) else {
            continue;
        };
        let key = entity.output_key(entity_id);
        let hints = entity.llm.clone().unwrap_or_default();

        match hints.description {
            Some(ref desc) if !desc.trim().is_empty() => {
                lines.push(format!("- **{}**: {}", key, desc.trim()));
            }
            _ => lines.push(format!("- **{}**", key)),
        }
        if !entity.context.is_empty() {
            lines.push(format!(
                "  - Context indicators: {}",
                entity.context.join(", ")
            ));
        }
        if !hints.examples.is_empty() {
            lines.push(format!("  - Examples: {}", hints.examples.join(", ")));
        }
        if !hints.notes.is_empty() {
            lines.push(format!("  - Notes: {}", hints.notes.join(" ")));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ConfigLoader;
    use crate::textgen::Role;

    fn us_config() -> JurisdictionConfig {
        ConfigLoader::new().load("US").unwrap()
    }

    #[test]
    fn test_detection_messages_shape() {
        let config = us_config();
        let provider = PromptProvider::from_config(&config);
        let ids = vec!["us-ssn".to_string(), "date-of-birth".to_string()];

        let messages = provider.detection_messages(&config, "SSN is 123-45-6789", &ids);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
        assert!(messages[0].content.contains("US_SSN"));
        assert!(messages[0].content.contains("DATE_OF_BIRTH"));
        assert!(messages[1].content.contains("SSN is 123-45-6789"));
    }

    #[test]
    fn test_schema_lists_keys_in_given_order() {
        let config = us_config();
        let ids = vec!["us-ssn".to_string(), "date-of-birth".to_string()];

        let schema = output_schema(&config, &ids);
        let ssn_pos = schema.find("US_SSN").unwrap();
        let dob_pos = schema.find("DATE_OF_BIRTH").unwrap();
        assert!(ssn_pos < dob_pos);
        assert!(schema.trim_start().starts_with('{'));
        assert!(schema.trim_end().ends_with('}'));
    }

    #[test]
    fn test_entities_doc_includes_hints() {
        let config = us_config();
        let ids = vec!["date-of-birth".to_string()];

        let doc = entities_doc(&config, &ids);
        assert!(doc.contains("DATE_OF_BIRTH"));
        assert!(doc.contains("Context indicators:"));
        assert!(doc.contains("Examples:"));
    }

    #[test]
    fn test_judge_messages_carry_candidates() {
        let config = us_config();
        let provider = PromptProvider::from_config(&config);
        let candidates = vec![
            JudgeCandidate {
                index: 0,
                entity_type: "US_SSN".to_string(),
                value: "123-45-6789".to_string(),
                start: 4,
                end: 15,
            },
            JudgeCandidate {
                index: 1,
                entity_type: "PHONE_NUMBER".to_string(),
                value: "123-45-6789".to_string(),
                start: 4,
                end: 15,
            },
        ];

        let messages = provider.judge_messages("SSN 123-45-6789", &candidates);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("verdicts"));
        assert!(messages[1].content.contains("US_SSN"));
        assert!(messages[1].content.contains("PHONE_NUMBER"));
    }
}
