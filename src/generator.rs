//! Text-generation backends.

use crate::config::GeneratorConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("API not configured")]
    NotConfigured,

    #[error("generation request failed: {0}")]
    Http(reqwest::Error),

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation request failed: rate limited (HTTP 429): {0}")]
    RateLimited(String),

    #[error("generation request failed: model returned no text")]
    EmptyResponse,

    #[error("previous stage produced no usable output ({upstream} failed)")]
    DependencyFailed { upstream: &'static str },
}

// Request URLs never reach error text, logs or stored outputs.
impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError::Http(err.without_url())
    }
}

impl GenerationError {
    /// Also matches quota errors reported only in the message text.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            GenerationError::RateLimited(_) => true,
            GenerationError::Http(err) => err.status() == Some(StatusCode::TOO_MANY_REQUESTS),
            GenerationError::Request(message) => {
                message.contains("429") || message.contains("RESOURCE_EXHAUSTED")
            }
            _ => false,
        }
    }
}

/// Anything that can turn a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Client for the Generative Language `generateContent` endpoint.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl GeminiClient {
    pub fn new(
        api_key: impl Into<String>,
        config: &GeneratorConfig,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: config.model.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Builds a client when the config carries a key; `Ok(None)` means generation is disabled.
    pub fn from_config(config: &GeneratorConfig) -> Result<Option<Self>, GenerationError> {
        match config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Self::new(key, config).map(Some),
            _ => Ok(None),
        }
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|part| part.text).collect();
        if text.trim().is_empty() { None } else { Some(text) }
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![RequestPart { text: prompt }],
            }],
        };
        let start = Instant::now();
        let response = self
            .client
            .post(self.url())
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::RateLimited(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Request(format!("HTTP {status}: {body}")));
        }

        let payload: GenerateResponse = response.json().await?;
        debug!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generateContent returned"
        );
        payload.into_text().ok_or(GenerationError::EmptyResponse)
    }
}
