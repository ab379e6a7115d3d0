//! Reply generation. The scheduler only sees [`Generator`]; the bundled
//! implementation talks to the Gemini `generateContent` endpoint.

use crate::config::GeneratorConfig;
use crate::error::{GenerationError, Result};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

/// Produces reply text for a prompt.
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    async fn generate(&self, prompt: &str) -> std::result::Result<String, GenerationError>;
}

/// Run the generator, substituting `fallback` for any failure.
pub async fn generate_or_fallback(generator: &dyn Generator, prompt: &str, fallback: &str) -> String {
    match generator.generate(prompt).await {
        Ok(reply) => reply,
        Err(error) => {
            tracing::warn!(%error, "reply generation failed, using fallback reply");
            fallback.to_string()
        }
    }
}

/// Gemini REST client.
pub struct GeminiGenerator {
    http_client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl GeminiGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        if config.api_key.is_none() {
            tracing::warn!("no generator API key configured, every reply will be the fallback");
        }

        Ok(Self {
            http_client,
            url: format!(
                "{}/v1beta/models/{}:generateContent",
                config.endpoint.trim_end_matches('/'),
                config.model
            ),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> std::result::Result<String, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::MissingApiKey)?;

        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self
            .http_client
            .post(&self.url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| GenerationError::Request(error.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| GenerationError::Request(error.to_string()))?;

        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        extract_reply(&text)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Pull the first candidate's first text part out of a response body.
fn extract_reply(body: &str) -> std::result::Result<String, GenerationError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|error| GenerationError::UnexpectedResponse(error.to_string()))?;

    parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts.into_iter().next())
        .and_then(|part| part.text)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| GenerationError::UnexpectedResponse("no candidate text".into()))
}
