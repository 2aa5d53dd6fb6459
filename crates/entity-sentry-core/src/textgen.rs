//! Text-generation collaborator
//!
//! The classifier talks to its model backend through the [`TextGeneration`]
//! trait: an ordered list of role-tagged messages goes in, a parsed JSON
//! object (preferred) or raw text comes out. Backend failures never propagate
//! past this boundary; callers receive `None` and degrade to zero candidates.
//!
//! [`OpenAiCompatClient`] implements the trait against any chat-completions
//! compatible HTTP endpoint with bounded exponential-backoff retries on
//! rate-limit-class failures.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Contract for the detection and arbitration model calls.
#[async_trait]
pub trait TextGeneration: Send + Sync {
    /// Generate and parse a JSON object, with best-effort repair of the raw
    /// text before giving up. `None` on any backend or parse failure.
    async fn generate_entity(&self, messages: &[Message]) -> Option<serde_json::Value>;

    /// Generate raw text. `None` on any backend failure.
    async fn generate(&self, messages: &[Message]) -> Option<String>;
}

/// Retry tuning for rate-limit-class failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Ceiling on total elapsed time across all attempts.
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_elapsed_ms() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay for the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

const RATE_LIMIT_INDICATORS: [&str; 8] = [
    "too many tokens",
    "ratelimiterror",
    "rate limit",
    "rate limiting",
    "too many requests",
    "quota exceeded",
    "throttling",
    "throttled",
];

/// True when an error message indicates a rate-limit condition worth retrying.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429") || RATE_LIMIT_INDICATORS.iter().any(|ind| lower.contains(ind))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmClientConfig {
    #[serde(default)]
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Chat-completions client for OpenAI-compatible endpoints (vLLM, Together,
/// and friends).
pub struct OpenAiCompatClient {
    client: Client,
    config: LlmClientConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    async fn call_once(&self, messages: &[Message]) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: 0.0,
        };

        let url = format!(
            "{}/v1/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        debug!("Calling chat completion endpoint {}", url);

        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("chat completion failed: {} - {}", status, body));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("chat completion returned no choices"))
    }

    /// Call the backend, retrying with exponential backoff on rate-limit
    /// failures until the retry or elapsed-time budget is exhausted.
    async fn call_with_retry(&self, messages: &[Message]) -> Result<String> {
        let started = Instant::now();
        let max_elapsed = Duration::from_millis(self.config.retry.max_elapsed_ms);
        let mut attempt: u32 = 0;

        loop {
            match self.call_once(messages).await {
                Ok(text) => return Ok(text),
                Err(err) if is_rate_limit_message(&err.to_string()) => {
                    attempt += 1;
                    if attempt >= self.config.retry.max_retries {
                        error!(
                            "Giving up after {} rate-limited attempts: {}",
                            attempt, err
                        );
                        return Err(err);
                    }
                    let delay = self.config.retry.delay_for(attempt);
                    if started.elapsed() + delay > max_elapsed {
                        error!("Retry time budget exhausted: {}", err);
                        return Err(err);
                    }
                    warn!(
                        "Rate limit hit, retrying in {:.1}s (attempt {}/{})",
                        delay.as_secs_f64(),
                        attempt,
                        self.config.retry.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl TextGeneration for OpenAiCompatClient {
    async fn generate_entity(&self, messages: &[Message]) -> Option<serde_json::Value> {
        if !self.config.enabled {
            debug!("Text generation disabled, skipping call");
            return None;
        }
        match self.call_with_retry(messages).await {
            Ok(text) => match parse_json_lenient(&text) {
                Some(value) => Some(value),
                None => {
                    warn!("Model response contained no parseable JSON");
                    None
                }
            },
            Err(err) => {
                error!("Text generation failed: {}", err);
                None
            }
        }
    }

    async fn generate(&self, messages: &[Message]) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        match self.call_with_retry(messages).await {
            Ok(text) => Some(text),
            Err(err) => {
                error!("Text generation failed: {}", err);
                None
            }
        }
    }
}

/// Backend that never produces output; used when no model is configured.
pub struct DisabledTextGeneration;

#[async_trait]
impl TextGeneration for DisabledTextGeneration {
    async fn generate_entity(&self, _messages: &[Message]) -> Option<serde_json::Value> {
        None
    }

    async fn generate(&self, _messages: &[Message]) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// JSON extraction & repair
// ---------------------------------------------------------------------------

/// Parse the first JSON object found in a model response. Strips code fences,
/// scans for a balanced object, and falls back to trailing-comma repair
/// before giving up.
pub fn parse_json_lenient(response: &str) -> Option<serde_json::Value> {
    let cleaned = response.replace("```json", "").replace("```", "");

    let candidate = extract_first_json_object(&cleaned)?;
    if let Ok(value) = serde_json::from_str(&candidate) {
        return Some(value);
    }

    let repaired = strip_trailing_commas(&candidate);
    serde_json::from_str(&repaired).ok()
}

/// First balanced `{...}` block in `text`, or the whole trimmed text when it
/// already looks like an object.
fn extract_first_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }
    None
}

fn strip_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in json.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '}' | ']' => {
                while out
                    .trim_end()
                    .ends_with(',')
                {
                    let trimmed_len = out.trim_end().len();
                    out.truncate(trimmed_len - 1);
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let response = r#"Here is the JSON: {"US_SSN": ["123-45-6789"]} End of response."#;
        let value = parse_json_lenient(response).unwrap();
        assert_eq!(value["US_SSN"][0], "123-45-6789");
    }

    #[test]
    fn test_extract_json_with_code_fences() {
        let response = "```json\n{\"US_SSN\": []}\n```";
        let value = parse_json_lenient(response).unwrap();
        assert!(value["US_SSN"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_extract_first_of_multiple_objects() {
        let response = "{\"a\": 1}\n\n{\"b\": 2}";
        let value = parse_json_lenient(response).unwrap();
        assert_eq!(value["a"], 1);
        assert!(value.get("b").is_none());
    }

    #[test]
    fn test_repair_trailing_commas() {
        let response = r#"{"keys": ["a", "b",], "more": {"x": 1,},}"#;
        let value = parse_json_lenient(response).unwrap();
        assert_eq!(value["keys"].as_array().unwrap().len(), 2);
        assert_eq!(value["more"]["x"], 1);
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_scan() {
        let response = r#"{"note": "braces } inside { strings", "n": 3}"#;
        let value = parse_json_lenient(response).unwrap();
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn test_no_json_yields_none() {
        assert!(parse_json_lenient("no json here").is_none());
    }

    #[test]
    fn test_rate_limit_classification() {
        assert!(is_rate_limit_message("HTTP 429 Too Many Requests"));
        assert!(is_rate_limit_message("server is throttling you"));
        assert!(is_rate_limit_message("quota exceeded for model"));
        assert!(!is_rate_limit_message("model not found"));
        assert!(!is_rate_limit_message("connection refused"));
    }

    #[test]
    fn test_backoff_delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 4_000,
            max_elapsed_ms: 300_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4_000));
    }

    #[test]
    fn test_disabled_backend_returns_none() {
        let backend = DisabledTextGeneration;
        tokio_test::block_on(async {
            assert!(backend.generate(&[Message::user("hi")]).await.is_none());
            assert!(backend
                .generate_entity(&[Message::user("hi")])
                .await
                .is_none());
        });
    }
}
