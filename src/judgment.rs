use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::JudgeConfig;
use crate::models::{CanonicalValuesCard, CardContent, ValuesCard};

#[derive(Debug, Error)]
pub enum JudgmentError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Response parsing failed: {0}")]
    ParseError(String),
    #[error("Timeout exceeded")]
    Timeout,
    #[error("Judgment service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl JudgmentError {
    /// Whether a later attempt can reasonably succeed. Model answers that do
    /// not parse count as transient since they are sampled again on retry.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            JudgmentError::InvalidUrl(_) | JudgmentError::ConfigError(_)
        )
    }
}

/// Free-text judgments the pipeline delegates to a language model.
///
/// Implementations must be deterministic enough that asking the same question
/// about the same inputs gives the same answer; the pipeline re-asks on retry.
#[async_trait]
pub trait JudgmentService: Send + Sync {
    /// Do the two cards articulate the same underlying value?
    async fn judge_equivalence(
        &self,
        a: &ValuesCard,
        b: &ValuesCard,
        context: Option<&str>,
    ) -> Result<bool, JudgmentError>;

    /// Returns the member of `existing` that names the same context as `name`.
    async fn judge_context_equivalence(
        &self,
        name: &str,
        existing: &[String],
    ) -> Result<Option<String>, JudgmentError>;

    /// Index of the clearest, most complete card in a non-empty cluster.
    async fn select_best(&self, cluster: &[ValuesCard]) -> Result<usize, JudgmentError>;

    /// Index of the canonical card expressing the same value as `candidate`.
    async fn find_existing_duplicate(
        &self,
        candidate: &ValuesCard,
        canonicals: &[CanonicalValuesCard],
    ) -> Result<Option<usize>, JudgmentError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum JudgeProvider {
    OpenAI,
    Ollama,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
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
struct EquivalenceAnswer {
    same_value: bool,
}

#[derive(Debug, Deserialize)]
struct ContextAnswer {
    #[serde(rename = "match")]
    matched: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BestAnswer {
    best_index: usize,
}

#[derive(Debug, Deserialize)]
struct DuplicateAnswer {
    duplicate_index: Option<usize>,
}

const SYSTEM_PROMPT: &str = "You compare values cards. A values card describes \
something a person attends to when making a meaningful choice: a title, a short \
description and a list of policies (things they pay attention to). Two cards \
express the same value when a person living by one would make the same choices \
as a person living by the other, even if the wording differs. Answer with a \
single JSON object and nothing else.";

/// Language-model judge over Ollama or an OpenAI-compatible chat API.
#[derive(Clone, Debug)]
pub struct LlmJudge {
    config: JudgeConfig,
    provider: JudgeProvider,
    client: Client,
}

impl LlmJudge {
    pub fn new(config: JudgeConfig) -> Result<Self, JudgmentError> {
        let provider = match config.provider.to_lowercase().as_str() {
            "openai" => JudgeProvider::OpenAI,
            "ollama" => JudgeProvider::Ollama,
            other => {
                return Err(JudgmentError::ConfigError(format!(
                    "Unsupported judge provider: {other}"
                )))
            }
        };

        Url::parse(&config.base_url)
            .map_err(|e| JudgmentError::InvalidUrl(format!("Failed to parse URL: {e}")))?;

        if provider == JudgeProvider::OpenAI && config.api_key.is_empty() {
            return Err(JudgmentError::ConfigError(
                "OpenAI judge requires an API key".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(JudgmentError::HttpError)?;

        Ok(Self {
            config: JudgeConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            provider,
            client,
        })
    }

    fn format_card(card: &dyn CardContent) -> String {
        let policies: Vec<String> = card.policies().iter().map(|p| format!("  - {p}")).collect();
        format!(
            "Title: {}\nDescription: {}\nPolicies:\n{}",
            card.title(),
            card.description(),
            policies.join("\n")
        )
    }

    fn format_list(cards: &[&dyn CardContent]) -> String {
        cards
            .iter()
            .enumerate()
            .map(|(i, card)| format!("[{i}]\n{}", Self::format_card(*card)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Send one prompt and return the raw model text.
    async fn complete(&self, prompt: String) -> Result<String, JudgmentError> {
        self.execute_with_retry(|| async {
            match self.provider {
                JudgeProvider::Ollama => self.complete_ollama(&prompt).await,
                JudgeProvider::OpenAI => self.complete_openai(&prompt).await,
            }
        })
        .await
    }

    async fn complete_ollama(&self, prompt: &str) -> Result<String, JudgmentError> {
        let request = OllamaRequest {
            model: self.config.model.clone(),
            prompt: format!("{SYSTEM_PROMPT}\n\n{prompt}"),
            stream: false,
            format: "json".to_string(),
            options: OllamaOptions { temperature: 0.0 },
        };

        let url = format!("{}/api/generate", self.config.base_url);
        debug!("Sending judgment request to Ollama: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(map_request_error)?;

        if !response.status().is_success() {
            return Err(JudgmentError::ServiceUnavailable(format!(
                "HTTP {} from Ollama",
                response.status()
            )));
        }

        let ollama_response: OllamaResponse = response.json().await?;
        if !ollama_response.done {
            return Err(JudgmentError::MalformedResponse(
                "Received incomplete response from Ollama".to_string(),
            ));
        }

        Ok(ollama_response.response)
    }

    async fn complete_openai(&self, prompt: &str) -> Result<String, JudgmentError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(map_request_error)?;

        if !response.status().is_success() {
            return Err(JudgmentError::ServiceUnavailable(format!(
                "HTTP {} from OpenAI",
                response.status()
            )));
        }

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| JudgmentError::MalformedResponse("No choices in response".to_string()))
    }

    /// Execute request with simple exponential backoff retry
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, JudgmentError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, JudgmentError>>,
    {
        let mut retry_count = 0;
        let mut delay_ms = self.config.initial_retry_delay_ms;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    retry_count += 1;

                    if !e.is_transient() || retry_count >= self.config.max_retries {
                        return Err(e);
                    }

                    warn!(
                        "Judgment request failed (attempt {}/{}), retrying in {}ms: {}",
                        retry_count, self.config.max_retries, delay_ms, e
                    );

                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                    // Exponential backoff with cap
                    delay_ms = (delay_ms * 2).min(self.config.max_retry_delay_ms);
                }
            }
        }
    }

    async fn ask<T: DeserializeOwned>(&self, prompt: String) -> Result<T, JudgmentError> {
        let text = self.complete(prompt).await?;
        parse_json_answer(&text)
    }
}

fn map_request_error(e: reqwest::Error) -> JudgmentError {
    if e.is_timeout() {
        JudgmentError::Timeout
    } else {
        JudgmentError::HttpError(e)
    }
}

/// Pull the outermost JSON object out of a model response, tolerating any
/// chatter around it.
pub(crate) fn parse_json_answer<T: DeserializeOwned>(response_text: &str) -> Result<T, JudgmentError> {
    let json_start = response_text.find('{').ok_or_else(|| {
        JudgmentError::MalformedResponse("No JSON object found in response".to_string())
    })?;

    let json_end = response_text.rfind('}').ok_or_else(|| {
        JudgmentError::MalformedResponse("No closing brace found in JSON".to_string())
    })?;

    if json_end < json_start {
        return Err(JudgmentError::MalformedResponse(
            "Closing brace precedes opening brace".to_string(),
        ));
    }

    serde_json::from_str(&response_text[json_start..=json_end])
        .map_err(|e| JudgmentError::ParseError(format!("JSON parsing failed: {e}")))
}

#[async_trait]
impl JudgmentService for LlmJudge {
    async fn judge_equivalence(
        &self,
        a: &ValuesCard,
        b: &ValuesCard,
        context: Option<&str>,
    ) -> Result<bool, JudgmentError> {
        let context_line = context
            .map(|c| format!("Both cards were written about choices in this context: {c}\n\n"))
            .unwrap_or_default();

        let prompt = format!(
            "{context_line}Card A:\n{}\n\nCard B:\n{}\n\n\
             Do these two cards express the same value? \
             Respond with {{\"same_value\": true}} or {{\"same_value\": false}}.",
            Self::format_card(a),
            Self::format_card(b)
        );

        let answer: EquivalenceAnswer = self.ask(prompt).await?;
        debug!(a = %a.id, b = %b.id, same = answer.same_value, "Equivalence judged");
        Ok(answer.same_value)
    }

    async fn judge_context_equivalence(
        &self,
        name: &str,
        existing: &[String],
    ) -> Result<Option<String>, JudgmentError> {
        if existing.is_empty() {
            return Ok(None);
        }

        let listed: Vec<String> = existing.iter().map(|n| format!("- {n}")).collect();
        let prompt = format!(
            "A context names the kind of situation in which a choice is made.\n\n\
             New context: {name}\n\nExisting contexts:\n{}\n\n\
             If one existing context means the same thing as the new one, respond with \
             {{\"match\": \"<existing context exactly as written>\"}}, otherwise respond \
             with {{\"match\": null}}.",
            listed.join("\n")
        );

        let answer: ContextAnswer = self.ask(prompt).await?;
        let Some(matched) = answer.matched else {
            return Ok(None);
        };

        // Only names that actually exist count; the model sometimes paraphrases.
        let found = existing
            .iter()
            .find(|e| e.trim().eq_ignore_ascii_case(matched.trim()))
            .cloned();
        if found.is_none() {
            warn!(context = name, answer = %matched, "Judge named a context that does not exist");
        }
        Ok(found)
    }

    async fn select_best(&self, cluster: &[ValuesCard]) -> Result<usize, JudgmentError> {
        match cluster.len() {
            0 => {
                return Err(JudgmentError::ConfigError(
                    "Cannot select a representative from an empty cluster".to_string(),
                ))
            }
            1 => return Ok(0),
            _ => {}
        }

        let cards: Vec<&dyn CardContent> = cluster.iter().map(|c| c as &dyn CardContent).collect();
        let prompt = format!(
            "The following cards all express the same value:\n\n{}\n\n\
             Which card articulates it most clearly and completely? \
             Respond with {{\"best_index\": <index>}}.",
            Self::format_list(&cards)
        );

        let answer: BestAnswer = self.ask(prompt).await?;
        if answer.best_index >= cluster.len() {
            return Err(JudgmentError::ParseError(format!(
                "best_index {} out of range for cluster of {}",
                answer.best_index,
                cluster.len()
            )));
        }

        info!(
            "Selected representative {} of {} cards",
            answer.best_index,
            cluster.len()
        );
        Ok(answer.best_index)
    }

    async fn find_existing_duplicate(
        &self,
        candidate: &ValuesCard,
        canonicals: &[CanonicalValuesCard],
    ) -> Result<Option<usize>, JudgmentError> {
        if canonicals.is_empty() {
            return Ok(None);
        }

        let cards: Vec<&dyn CardContent> =
            canonicals.iter().map(|c| c as &dyn CardContent).collect();
        let prompt = format!(
            "New card:\n{}\n\nExisting cards:\n\n{}\n\n\
             If one existing card expresses the same value as the new card, respond with \
             {{\"duplicate_index\": <index>}}, otherwise {{\"duplicate_index\": null}}.",
            Self::format_card(candidate),
            Self::format_list(&cards)
        );

        let answer: DuplicateAnswer = self.ask(prompt).await?;
        match answer.duplicate_index {
            Some(i) if i >= canonicals.len() => Err(JudgmentError::ParseError(format!(
                "duplicate_index {i} out of range for {} canonical cards",
                canonicals.len()
            ))),
            other => Ok(other),
        }
    }
}

type EquivalenceRule = Arc<dyn Fn(&ValuesCard, &ValuesCard) -> bool + Send + Sync>;

/// Rule-based judge for tests and dry runs.
///
/// Cards are equivalent when their normalized titles match unless a custom
/// rule is installed. The best card is the one with the longest description,
/// earliest on ties.
#[derive(Clone)]
pub struct MockJudge {
    rule: EquivalenceRule,
    should_fail: bool,
    fail_count: Arc<Mutex<usize>>,
    equivalence_calls: Arc<AtomicUsize>,
    duplicate_calls: Arc<AtomicUsize>,
}

impl MockJudge {
    pub fn new() -> Self {
        Self {
            rule: Arc::new(|a: &ValuesCard, b: &ValuesCard| {
                normalize_title(&a.title) == normalize_title(&b.title)
            }),
            should_fail: false,
            fail_count: Arc::new(Mutex::new(0)),
            equivalence_calls: Arc::new(AtomicUsize::new(0)),
            duplicate_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_rule<F>(rule: F) -> Self
    where
        F: Fn(&ValuesCard, &ValuesCard) -> bool + Send + Sync + 'static,
    {
        Self {
            rule: Arc::new(rule),
            ..Self::new()
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new()
        }
    }

    pub fn with_intermittent_failure(self, fail_times: usize) -> Self {
        if let Ok(mut count) = self.fail_count.lock() {
            *count = fail_times;
        }
        self
    }

    pub fn equivalence_calls(&self) -> usize {
        self.equivalence_calls.load(Ordering::SeqCst)
    }

    pub fn duplicate_calls(&self) -> usize {
        self.duplicate_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<(), JudgmentError> {
        if let Ok(mut count) = self.fail_count.lock() {
            if *count > 0 {
                *count -= 1;
                return Err(JudgmentError::ServiceUnavailable(
                    "Mock judge configured to fail".to_string(),
                ));
            }
        }
        if self.should_fail {
            return Err(JudgmentError::ServiceUnavailable(
                "Mock judge configured to always fail".to_string(),
            ));
        }
        Ok(())
    }

    fn as_candidate(canonical: &CanonicalValuesCard) -> ValuesCard {
        ValuesCard {
            id: canonical.id,
            deliberation_id: canonical.deliberation_id,
            chat_id: None,
            title: canonical.title.clone(),
            description: canonical.description.clone(),
            policies: canonical.policies.clone(),
            embedding: canonical.embedding.clone(),
            canonical_card_id: None,
            created_at: canonical.created_at,
        }
    }
}

impl Default for MockJudge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockJudge")
            .field("should_fail", &self.should_fail)
            .field("equivalence_calls", &self.equivalence_calls())
            .finish()
    }
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
impl JudgmentService for MockJudge {
    async fn judge_equivalence(
        &self,
        a: &ValuesCard,
        b: &ValuesCard,
        _context: Option<&str>,
    ) -> Result<bool, JudgmentError> {
        self.check_failure()?;
        self.equivalence_calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.rule)(a, b))
    }

    async fn judge_context_equivalence(
        &self,
        name: &str,
        existing: &[String],
    ) -> Result<Option<String>, JudgmentError> {
        self.check_failure()?;
        let wanted = normalize_title(name);
        Ok(existing.iter().find(|e| normalize_title(e) == wanted).cloned())
    }

    async fn select_best(&self, cluster: &[ValuesCard]) -> Result<usize, JudgmentError> {
        self.check_failure()?;
        let mut best: Option<(usize, usize)> = None;
        for (i, card) in cluster.iter().enumerate() {
            let len = card.description.chars().count();
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((i, len));
            }
        }
        best.map(|(i, _)| i).ok_or_else(|| {
            JudgmentError::ConfigError("Cannot select a representative from an empty cluster".to_string())
        })
    }

    async fn find_existing_duplicate(
        &self,
        candidate: &ValuesCard,
        canonicals: &[CanonicalValuesCard],
    ) -> Result<Option<usize>, JudgmentError> {
        self.check_failure()?;
        self.duplicate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(canonicals
            .iter()
            .position(|c| (self.rule)(candidate, &Self::as_candidate(c))))
    }
}

/// Build the judge named by the configuration.
pub fn judge_from_config(config: &JudgeConfig) -> Result<Arc<dyn JudgmentService>, JudgmentError> {
    if config.provider.eq_ignore_ascii_case("mock") {
        return Ok(Arc::new(MockJudge::new()));
    }
    Ok(Arc::new(LlmJudge::new(config.clone())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn card(title: &str, description: &str) -> ValuesCard {
        ValuesCard {
            id: Uuid::new_v4(),
            deliberation_id: 1,
            chat_id: None,
            title: title.to_string(),
            description: description.to_string(),
            policies: vec!["MOMENTS when it matters".to_string()],
            embedding: None,
            canonical_card_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_json_answer_with_chatter() {
        let answer: EquivalenceAnswer =
            parse_json_answer("Sure! Here you go: {\"same_value\": true} Hope that helps.").unwrap();
        assert!(answer.same_value);

        let answer: DuplicateAnswer = parse_json_answer("{\"duplicate_index\": null}").unwrap();
        assert!(answer.duplicate_index.is_none());
    }

    #[test]
    fn test_parse_json_answer_rejects_garbage() {
        let result: Result<EquivalenceAnswer, _> = parse_json_answer("no json here");
        assert!(matches!(result, Err(JudgmentError::MalformedResponse(_))));

        let result: Result<EquivalenceAnswer, _> = parse_json_answer("} backwards {");
        assert!(matches!(result, Err(JudgmentError::MalformedResponse(_))));

        let result: Result<EquivalenceAnswer, _> = parse_json_answer("{\"same_value\": \"maybe\"}");
        assert!(matches!(result, Err(JudgmentError::ParseError(_))));
    }

    #[test]
    fn test_error_transience() {
        assert!(JudgmentError::Timeout.is_transient());
        assert!(JudgmentError::ServiceUnavailable("down".into()).is_transient());
        assert!(!JudgmentError::ConfigError("bad".into()).is_transient());
    }

    #[test]
    fn test_llm_judge_creation() {
        let config = JudgeConfig::default();
        assert!(LlmJudge::new(config.clone()).is_ok());

        let openai_without_key = JudgeConfig {
            provider: "openai".to_string(),
            ..config.clone()
        };
        assert!(matches!(
            LlmJudge::new(openai_without_key),
            Err(JudgmentError::ConfigError(_))
        ));

        let bad_url = JudgeConfig {
            base_url: "not a url".to_string(),
            ..config
        };
        assert!(matches!(LlmJudge::new(bad_url), Err(JudgmentError::InvalidUrl(_))));
    }

    #[test]
    fn test_prompt_formatting_lists_indices() {
        let a = card("Honesty", "Telling the truth");
        let b = card("Candor", "Saying what I think");
        let cards: Vec<&dyn CardContent> = vec![&a, &b];
        let text = LlmJudge::format_list(&cards);
        assert!(text.starts_with("[0]\nTitle: Honesty"));
        assert!(text.contains("[1]\nTitle: Candor"));
        assert!(text.contains("  - MOMENTS when it matters"));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_llm_judge_futures_are_send() {
        let judge = LlmJudge::new(JudgeConfig::default()).unwrap();
        let cluster = vec![card("Honesty", "Telling the truth"), card("Candor", "Saying what I think")];
        let canonical = CanonicalValuesCard {
            id: Uuid::new_v4(),
            deliberation_id: 1,
            title: "Honesty".to_string(),
            description: "Telling the truth".to_string(),
            policies: vec!["MOMENTS when it matters".to_string()],
            embedding: None,
            source_card_id: None,
            created_at: Utc::now(),
        };

        // Workers run judge calls on the multi-threaded runtime.
        assert_send(&judge.select_best(&cluster));
        let canonicals = [canonical];
        assert_send(&judge.find_existing_duplicate(&cluster[0], &canonicals));
    }

    #[tokio::test]
    async fn test_mock_judge_title_rule() {
        let judge = MockJudge::new();
        let a = card("Honest  Feedback", "x");
        let b = card("honest feedback", "y");
        let c = card("Curiosity", "z");

        assert!(judge.judge_equivalence(&a, &b, None).await.unwrap());
        assert!(!judge.judge_equivalence(&a, &c, None).await.unwrap());
        assert_eq!(judge.equivalence_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_judge_select_best_prefers_longest_then_earliest() {
        let judge = MockJudge::new();
        let cluster = vec![card("A", "short"), card("B", "much longer"), card("C", "also longer")];
        assert_eq!(judge.select_best(&cluster).await.unwrap(), 1);
        assert!(judge.select_best(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_judge_intermittent_failure() {
        let judge = MockJudge::new().with_intermittent_failure(1);
        let a = card("A", "x");
        assert!(judge.judge_equivalence(&a, &a, None).await.is_err());
        assert!(judge.judge_equivalence(&a, &a, None).await.unwrap());

        let failing = MockJudge::with_failure();
        assert!(failing.select_best(&[a]).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_judge_context_match() {
        let judge = MockJudge::new();
        let existing = vec!["Giving advice".to_string(), "Parenting".to_string()];
        assert_eq!(
            judge
                .judge_context_equivalence("giving  advice", &existing)
                .await
                .unwrap(),
            Some("Giving advice".to_string())
        );
        assert_eq!(
            judge.judge_context_equivalence("Work", &existing).await.unwrap(),
            None
        );
    }

    #[test]
    fn test_judge_from_config() {
        let config = JudgeConfig {
            provider: "mock".to_string(),
            ..JudgeConfig::default()
        };
        assert!(judge_from_config(&config).is_ok());

        let config = JudgeConfig {
            provider: "bogus".to_string(),
            ..JudgeConfig::default()
        };
        assert!(judge_from_config(&config).is_err());
    }
}
