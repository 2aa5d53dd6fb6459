//! Jurisdiction configuration loading
//!
//! Resolves a jurisdiction code to its validated [`JurisdictionConfig`].
//! Lookup order: override directory, default application config directory,
//! embedded builtin document. Loading is deterministic for a given file
//! content; the orchestrator caches the result for the process lifetime.

use crate::config::JurisdictionConfig;
use crate::error::{ClassifierError, Result};
use anyhow::Context;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const US_BUILTIN: &str = include_str!("configs/us.toml");
const GLOBAL_BUILTIN: &str = include_str!("configs/global.toml");

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    override_dir: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `dir` as the primary lookup location for jurisdiction documents.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            override_dir: Some(dir.into()),
        }
    }

    /// Load and validate the configuration for `jurisdiction`.
    pub fn load(&self, jurisdiction: &str) -> Result<JurisdictionConfig> {
        let code = jurisdiction.trim().to_uppercase();
        if code.is_empty() {
            return Err(ClassifierError::ConfigNotFound(jurisdiction.to_string()));
        }

        if let Some(path) = self.find_file(&code) {
            info!("Loading jurisdiction '{}' from {}", code, path.display());
            let contents = std::fs::read_to_string(&path)?;
            return JurisdictionConfig::from_toml_str(&contents, &code);
        }

        if let Some(builtin) = builtin_document(&code) {
            debug!("Loading embedded builtin configuration for '{}'", code);
            return JurisdictionConfig::from_toml_str(builtin, &code);
        }

        Err(ClassifierError::ConfigNotFound(code))
    }

    fn find_file(&self, code: &str) -> Option<PathBuf> {
        let file_name = format!("{}.toml", code.to_lowercase());

        if let Some(ref dir) = self.override_dir {
            let candidate = dir.join(&file_name);
            if candidate.exists() {
                return Some(candidate);
            }
            debug!(
                "No document for '{}' in override dir {}",
                code,
                dir.display()
            );
        }

        match default_entities_dir() {
            Ok(dir) => {
                let candidate = dir.join(&file_name);
                candidate.exists().then_some(candidate)
            }
            Err(e) => {
                warn!("Could not determine default config directory: {}", e);
                None
            }
        }
    }
}

fn builtin_document(code: &str) -> Option<&'static str> {
    match code {
        "US" => Some(US_BUILTIN),
        "GLOBAL" => Some(GLOBAL_BUILTIN),
        _ => None,
    }
}

fn default_entities_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "entity-sentry", "entity-sentry")
        .context("failed to determine application directories")?;
    Ok(dirs.config_dir().join("entities"))
}

/// Write a builtin document out as a starting point for customization.
pub fn export_builtin(code: &str, path: &Path) -> Result<()> {
    let contents = builtin_document(&code.to_uppercase())
        .ok_or_else(|| ClassifierError::ConfigNotFound(code.to_string()))?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_us_loads_and_validates() {
        let loader = ConfigLoader::new();
        let config = loader.load("US").unwrap();

        assert_eq!(config.jurisdiction, "US");
        assert!(config.entities.contains_key("us-ssn"));
        assert!(config.entities.contains_key("date-of-birth"));
        assert!(config.entities["us-ssn"].enabled);
    }

    #[test]
    fn test_builtin_global_loads() {
        let loader = ConfigLoader::new();
        let config = loader.load("global").unwrap();

        assert_eq!(config.jurisdiction, "GLOBAL");
        assert!(config.entities.contains_key("email"));
    }

    #[test]
    fn test_unknown_jurisdiction_is_config_not_found() {
        let loader = ConfigLoader::new();

        assert!(matches!(
            loader.load("ZZ"),
            Err(ClassifierError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn test_override_dir_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let doc = r#"
jurisdiction = "US"

[entities.only-entity]
group = "misc"

[entities.only-entity.detect]
methods = ["regex"]

[[entities.only-entity.detect.patterns]]
pattern = 'x+'
"#;
        std::fs::write(dir.path().join("us.toml"), doc).unwrap();

        let loader = ConfigLoader::with_dir(dir.path());
        let config = loader.load("US").unwrap();

        assert_eq!(config.entities.len(), 1);
        assert!(config.entities.contains_key("only-entity"));
    }

    #[test]
    fn test_invalid_document_surfaces_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("us.toml"), "not valid toml [").unwrap();

        let loader = ConfigLoader::with_dir(dir.path());
        assert!(loader.load("US").is_err());
    }

    #[test]
    fn test_export_builtin_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("us.toml");
        export_builtin("US", &path).unwrap();

        let loader = ConfigLoader::with_dir(dir.path());
        let config = loader.load("US").unwrap();
        assert!(config.entities.contains_key("us-ssn"));
    }
}
