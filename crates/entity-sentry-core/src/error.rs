//! Error taxonomy for the classifier core

use thiserror::Error;

/// Errors surfaced by the classifier core.
///
/// Configuration errors are fatal to classifier construction. Request errors
/// map to client-error responses. Everything else in the pipeline degrades
/// locally (empty detection results, rejected candidates) and never reaches
/// this enum.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("no configuration found for jurisdiction '{0}'")]
    ConfigNotFound(String),

    #[error("invalid configuration for jurisdiction '{jurisdiction}': {reason}")]
    InvalidConfig {
        jurisdiction: String,
        reason: String,
    },

    #[error("invalid regex pattern for entity '{entity}': {source}")]
    InvalidPattern {
        entity: String,
        #[source]
        source: regex::Error,
    },

    #[error("request text is empty")]
    EmptyText,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
