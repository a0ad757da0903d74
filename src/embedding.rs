use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;

/// Text to fixed-dimension vector. Results only need to be stable enough for
/// distance-based matching, not bit-identical across calls.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>>;

    fn embedding_dimension(&self) -> usize;

    async fn health_check(&self) -> Result<()> {
        self.generate_embedding("Health check test").await.map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct SimpleEmbedder {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    provider: EmbeddingProvider,
    max_elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingProvider {
    OpenAI,
    Ollama,
    Mock, // For testing and dry runs
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(EmbeddingProvider::OpenAI),
            "ollama" => Ok(EmbeddingProvider::Ollama),
            "mock" => Ok(EmbeddingProvider::Mock),
            other => Err(anyhow::anyhow!("Invalid embedding provider: {other}")),
        }
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest {
    input: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
}

// Ollama API request/response structures
#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl SimpleEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let provider: EmbeddingProvider = config.provider.parse()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            provider,
            max_elapsed: Duration::from_secs(config.max_retry_seconds),
        })
    }

    pub fn new_mock() -> Self {
        Self {
            client: Client::new(),
            api_key: String::new(),
            model: "mock-model".to_string(),
            base_url: "http://mock:11434".to_string(),
            provider: EmbeddingProvider::Mock,
            max_elapsed: Duration::from_secs(1),
        }
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn provider(&self) -> &EmbeddingProvider {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn generate_embedding_internal(&self, text: &str) -> Result<Vec<f32>> {
        match self.provider {
            EmbeddingProvider::OpenAI => self.generate_openai_embedding(text).await,
            EmbeddingProvider::Ollama => self.generate_ollama_embedding(text).await,
            EmbeddingProvider::Mock => Ok(mock_embedding(text, self.embedding_dimension())),
        }
    }

    async fn generate_openai_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let request = OpenAIEmbeddingRequest {
            input: text.to_string(),
            model: self.model.clone(),
        };

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let response = check_status(response, "OpenAI").await?;
        let embedding_response: OpenAIEmbeddingResponse = response.json().await?;

        embedding_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("No embedding data in OpenAI response"))
    }

    async fn generate_ollama_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await?;

        let response = check_status(response, "Ollama").await?;
        let embedding_response: OllamaEmbeddingResponse = response.json().await?;
        Ok(embedding_response.embedding)
    }
}

#[async_trait]
impl EmbeddingService for SimpleEmbedder {
    /// Generate embedding for text, retrying rate limits and server errors
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for text of length: {}", text.len());

        let operation = || async {
            match self.generate_embedding_internal(text).await {
                Ok(embedding) if embedding.is_empty() => Err(backoff::Error::permanent(
                    anyhow::anyhow!("Embedding service returned an empty vector"),
                )),
                Ok(embedding) => Ok(embedding),
                Err(e) => {
                    let message = e.to_string();
                    if message.contains("Rate limited") || message.contains("Server error") {
                        Err(backoff::Error::transient(e))
                    } else {
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        };

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        retry(backoff, operation).await
    }

    fn embedding_dimension(&self) -> usize {
        match self.provider {
            EmbeddingProvider::OpenAI => match self.model.as_str() {
                "text-embedding-3-large" => 3072,
                _ => 1536,
            },
            EmbeddingProvider::Ollama => match self.model.as_str() {
                "mxbai-embed-large" => 1024,
                "all-minilm" => 384,
                _ => 768,
            },
            EmbeddingProvider::Mock => 768,
        }
    }
}

async fn check_status(response: reqwest::Response, service: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    if status.as_u16() == 429 {
        warn!("Rate limited by {} API, will retry", service);
        return Err(anyhow::anyhow!("Rate limited: {}", error_text));
    }
    if status.is_server_error() {
        warn!("{} API returned {}, will retry", service, status);
        return Err(anyhow::anyhow!("Server error {}: {}", status, error_text));
    }

    Err(anyhow::anyhow!(
        "{} API request failed with status {}: {}",
        service,
        status,
        error_text
    ))
}

/// Deterministic unit vector derived from a hash of the text.
pub fn mock_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let mut seed = hasher.finish();

    let mut embedding = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
        let value = ((seed >> 16) % 1000) as f32 / 1000.0 - 0.5;
        embedding.push(value);
    }

    normalize(&mut embedding);
    embedding
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for val in vector.iter_mut() {
            *val /= magnitude;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[tokio::test]
    async fn test_mock_embedding_is_deterministic_and_normalized() {
        let embedder = SimpleEmbedder::new_mock();
        let a = embedder.generate_embedding("I value honesty").await.unwrap();
        let b = embedder.generate_embedding("I value honesty").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 768);

        let magnitude: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert_relative_eq!(magnitude, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!(
            "OpenAI".parse::<EmbeddingProvider>().unwrap(),
            EmbeddingProvider::OpenAI
        );
        assert_eq!(
            "ollama".parse::<EmbeddingProvider>().unwrap(),
            EmbeddingProvider::Ollama
        );
        assert!("bogus".parse::<EmbeddingProvider>().is_err());
    }

    #[test]
    fn test_embedding_dimensions() {
        let mut config = EmbeddingConfig::default();
        config.provider = "openai".to_string();
        config.model = "text-embedding-3-small".to_string();
        let embedder = SimpleEmbedder::from_config(&config).unwrap();
        assert_eq!(embedder.embedding_dimension(), 1536);

        let embedder = embedder.with_model("text-embedding-3-large".to_string());
        assert_eq!(embedder.embedding_dimension(), 3072);

        assert_eq!(SimpleEmbedder::new_mock().embedding_dimension(), 768);
    }

    #[tokio::test]
    #[ignore] // Requires running Ollama instance
    async fn test_generate_ollama_embedding() {
        let config = EmbeddingConfig::default();
        let embedder = SimpleEmbedder::from_config(&config).unwrap();
        let embedding = embedder.generate_embedding("Hello, world!").await.unwrap();
        assert_eq!(embedding.len(), 768);
    }
}
