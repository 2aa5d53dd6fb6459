//! Regex detection engine
//!
//! One pattern-based detector per enabled entity that declares the regex
//! method, plus a shared context-aware enhancer that raises confidence when
//! configured keywords appear in a token window around the match. Results are
//! deduplicated by exact (entity, span) before being returned.

use crate::config::{
    DetectionCandidate, DetectionMethod, EnhancerSettings, JurisdictionConfig,
};
use crate::error::{ClassifierError, Result};
use crate::validation::EntityKind;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Tokens inspected on each side of a match when looking for context words.
const CONTEXT_WINDOW_TOKENS: usize = 5;

struct EntityDetector {
    entity_id: String,
    patterns: Vec<(Regex, f64)>,
    context: Vec<String>,
}

/// Confidence booster shared by every detector of a jurisdiction.
#[derive(Debug, Clone)]
pub struct ContextEnhancer {
    similarity_factor: f64,
    min_score_with_context: f64,
}

impl ContextEnhancer {
    pub fn new(settings: &EnhancerSettings) -> Self {
        Self {
            similarity_factor: settings.similarity_factor,
            min_score_with_context: settings.min_score_with_context,
        }
    }

    /// Boosted confidence for a match at [start, end) given the entity's
    /// context keywords; the base score is returned unchanged when no keyword
    /// is nearby.
    pub fn enhance(
        &self,
        text: &str,
        start: usize,
        end: usize,
        keywords: &[String],
        score: f64,
    ) -> f64 {
        if keywords.is_empty() {
            return score;
        }

        let window = token_window(text, start, end);
        let found = keywords.iter().any(|kw| window.contains(kw.as_str()));
        if !found {
            return score;
        }

        let boosted = (score + self.similarity_factor).min(1.0);
        boosted.max(self.min_score_with_context)
    }
}

/// Lowercased text of up to `CONTEXT_WINDOW_TOKENS` tokens on each side of
/// the span, with the span itself excluded.
fn token_window(text: &str, start: usize, end: usize) -> String {
    let before: Vec<&str> = text[..clamp_boundary(text, start)]
        .split_whitespace()
        .rev()
        .take(CONTEXT_WINDOW_TOKENS)
        .collect();
    let after: Vec<&str> = text[clamp_boundary(text, end)..]
        .split_whitespace()
        .take(CONTEXT_WINDOW_TOKENS)
        .collect();

    let mut window = String::new();
    for token in before.iter().rev().chain(after.iter()) {
        if !window.is_empty() {
            window.push(' ');
        }
        window.push_str(token);
    }
    window.to_lowercase()
}

fn clamp_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Stock patterns seeded for entities that declare the builtin method.
fn builtin_patterns(kind: EntityKind) -> &'static [(&'static str, f64)] {
    match kind {
        EntityKind::Email => &[(
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            0.85,
        )],
        EntityKind::IpAddress => &[
            (
                r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
                0.6,
            ),
            (r"\b(?:[a-fA-F0-9]{1,4}:){7}[a-fA-F0-9]{1,4}\b", 0.6),
        ],
        EntityKind::Phone => &[(
            r"\b\+?1?[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b",
            0.4,
        )],
        EntityKind::CreditCard => &[(
            r"\b(?:4[0-9]{3}|5[1-5][0-9]{2}|3[47][0-9]{2}|6(?:011|5[0-9]{2}))[- ]?[0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{1,4}\b",
            0.5,
        )],
        _ => &[],
    }
}

/// Holds the compiled regex detectors for one jurisdiction.
pub struct RegexDetectorRegistry {
    detectors: Vec<EntityDetector>,
    enhancer: ContextEnhancer,
}

impl RegexDetectorRegistry {
    pub fn from_config(config: &JurisdictionConfig) -> Result<Self> {
        let mut detectors = Vec::new();

        for (entity_id, entity) in &config.entities {
            if !entity.enabled {
                continue;
            }

            let mut patterns: Vec<(Regex, f64)> = Vec::new();

            if entity.has_method(DetectionMethod::Regex) {
                for def in &entity.detect.patterns {
                    let regex = Regex::new(&def.pattern).map_err(|e| {
                        ClassifierError::InvalidPattern {
                            entity: entity_id.clone(),
                            source: e,
                        }
                    })?;
                    patterns.push((regex, def.score));
                }
            }

            if config.seed_builtin_detectors && entity.has_method(DetectionMethod::Builtin) {
                let kind = EntityKind::from_label(entity_id);
                for (pattern, score) in builtin_patterns(kind) {
                    match Regex::new(pattern) {
                        Ok(regex) => patterns.push((regex, *score)),
                        Err(e) => warn!("Builtin pattern for '{}' failed: {}", entity_id, e),
                    }
                }
            }

            if patterns.is_empty() {
                continue;
            }

            debug!(
                "Registered {} pattern(s) for entity '{}'",
                patterns.len(),
                entity_id
            );
            detectors.push(EntityDetector {
                entity_id: entity_id.clone(),
                patterns,
                context: entity.context.iter().map(|c| c.to_lowercase()).collect(),
            });
        }

        Ok(Self {
            detectors,
            enhancer: ContextEnhancer::new(&config.enhancer),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run every registered detector against `text`. Output is deduplicated
    /// by (entity, span) and sorted by start offset.
    pub fn detect(&self, text: &str) -> Vec<DetectionCandidate> {
        let mut seen: HashSet<(String, usize, usize)> = HashSet::new();
        let mut candidates = Vec::new();

        for detector in &self.detectors {
            for (regex, score) in &detector.patterns {
                for m in regex.find_iter(text) {
                    if m.start() == m.end() {
                        continue;
                    }
                    if !seen.insert((detector.entity_id.clone(), m.start(), m.end())) {
                        continue;
                    }
                    let confidence = self.enhancer.enhance(
                        text,
                        m.start(),
                        m.end(),
                        &detector.context,
                        *score,
                    );
                    candidates.push(DetectionCandidate::new(
                        detector.entity_id.clone(),
                        m.start(),
                        m.end(),
                        confidence,
                    ));
                }
            }
        }

        candidates.sort_by_key(|c| (c.start, c.end));
        candidates
    }
}
