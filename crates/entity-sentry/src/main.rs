//! Entity Sentry command-line interface

use anyhow::Result;
use clap::Parser;
use entity_sentry_core::{
    ClassificationRequest, ConfigLoader, DisabledTextGeneration, EntityClassifier,
    LlmClientConfig, OpenAiCompatClient, RetryPolicy, TextGeneration,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(help = "Text to classify; read from stdin when omitted")]
    pub text: Option<String>,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "US",
        help = "Jurisdiction codes to load (comma-separated)"
    )]
    pub jurisdictions: Vec<String>,

    #[arg(long, help = "Replace detected spans with placeholder tokens")]
    pub anonymize: bool,

    #[arg(long, help = "Directory holding jurisdiction TOML documents")]
    pub config_dir: Option<PathBuf>,

    #[arg(long, help = "Chat-completions endpoint for LLM detection and arbitration")]
    pub llm_endpoint: Option<String>,

    #[arg(long, help = "Model name for the LLM backend")]
    pub llm_model: Option<String>,

    #[arg(long, env = "ENTITY_SENTRY_API_KEY", help = "API key for the LLM backend")]
    pub llm_api_key: Option<String>,

    #[arg(long, default_value = "info", help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: String,
}

impl Args {
    fn build_backend(&self) -> Result<Arc<dyn TextGeneration>> {
        match (&self.llm_endpoint, &self.llm_model) {
            (Some(endpoint), Some(model)) => {
                info!("LLM backend enabled: {} ({})", endpoint, model);
                let client = OpenAiCompatClient::new(LlmClientConfig {
                    enabled: true,
                    endpoint: endpoint.clone(),
                    model: model.clone(),
                    api_key: self.llm_api_key.clone(),
                    timeout_seconds: 60,
                    retry: RetryPolicy::default(),
                })?;
                Ok(Arc::new(client))
            }
            _ => {
                info!("No LLM backend configured, running regex detection only");
                Ok(Arc::new(DisabledTextGeneration))
            }
        }
    }

    fn read_text(&self) -> Result<String> {
        match self.text {
            Some(ref text) => Ok(text.clone()),
            None => {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                Ok(buffer)
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log_level.parse::<tracing::Level>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", args.log_level);
        tracing::Level::INFO
    });

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting entity-sentry classifier");
    info!("Jurisdictions: {:?}", args.jurisdictions);

    let loader = match args.config_dir {
        Some(ref dir) => {
            info!("Loading jurisdiction documents from {}", dir.display());
            ConfigLoader::with_dir(dir)
        }
        None => ConfigLoader::new(),
    };

    let backend = args.build_backend()?;
    let classifier = EntityClassifier::new(&args.jurisdictions, &loader, backend)?;

    let text = args.read_text()?;
    let request = ClassificationRequest {
        text,
        anonymize: args.anonymize,
        jurisdictions: args.jurisdictions.clone(),
    };

    let response = classifier.classify(&request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jurisdictions_parse_comma_separated() {
        let args = Args::parse_from(["entity-sentry", "--jurisdictions", "US,GLOBAL", "text"]);
        assert_eq!(args.jurisdictions, vec!["US".to_string(), "GLOBAL".to_string()]);
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["entity-sentry", "some text"]);
        assert_eq!(args.jurisdictions, vec!["US".to_string()]);
        assert!(!args.anonymize);
        assert_eq!(args.log_level, "info");
        assert_eq!(args.text.as_deref(), Some("some text"));
    }

    #[test]
    fn test_disabled_backend_without_endpoint() {
        let args = Args::parse_from(["entity-sentry", "text"]);
        assert!(args.build_backend().is_ok());
    }
}
