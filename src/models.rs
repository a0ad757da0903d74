use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DedupError, Result};

/// Deliberations partition every entity; canonicalization never crosses them.
pub type DeliberationId = i64;

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_DESCRIPTION_CHARS: usize = 4_000;
pub const MAX_POLICY_CHARS: usize = 1_000;
pub const MAX_POLICIES: usize = 32;

/// Shared accessors for anything that reads like a values card. Judges hold
/// these across awaits, so implementors must be shareable between threads.
pub trait CardContent: Send + Sync {
    fn title(&self) -> &str;
    fn description(&self) -> &str;
    fn policies(&self) -> &[String];

    /// Text handed to the embedding service. Canonical cards copy their
    /// representative verbatim, so both embed to the same text.
    fn embedding_text(&self) -> String {
        let mut text = format!("{}\n{}", self.title(), self.description());
        for policy in self.policies() {
            text.push('\n');
            text.push_str(policy);
        }
        text
    }

    fn same_content(&self, other: &dyn CardContent) -> bool {
        self.title() == other.title()
            && self.description() == other.description()
            && self.policies() == other.policies()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliberation {
    pub id: DeliberationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// A submitted, possibly not yet canonicalized, values card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuesCard {
    pub id: Uuid,
    pub deliberation_id: DeliberationId,
    pub chat_id: Option<String>,
    pub title: String,
    pub description: String,
    pub policies: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub canonical_card_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ValuesCard {
    pub fn is_canonicalized(&self) -> bool {
        self.canonical_card_id.is_some()
    }
}

impl CardContent for ValuesCard {
    fn title(&self) -> &str {
        &self.title
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn policies(&self) -> &[String] {
        &self.policies
    }
}

/// The deduplicated representative of one value within a deliberation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalValuesCard {
    pub id: Uuid,
    pub deliberation_id: DeliberationId,
    pub title: String,
    pub description: String,
    pub policies: Vec<String>,
    /// Always populated for rows that come out of storage; kept optional so
    /// search results can be checked instead of trusted.
    pub embedding: Option<Vec<f32>>,
    /// The candidate this entity was promoted from.
    pub source_card_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CardContent for CanonicalValuesCard {
    fn title(&self) -> &str {
        &self.title
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn policies(&self) -> &[String] {
        &self.policies
    }
}

/// Content for a canonical card about to be created. The embedding is part of
/// the insert so the row is never searchable without one.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCanonicalCard {
    pub deliberation_id: DeliberationId,
    pub title: String,
    pub description: String,
    pub policies: Vec<String>,
    pub embedding: Vec<f32>,
    pub source_card_id: Uuid,
}

impl NewCanonicalCard {
    pub fn from_representative(representative: &ValuesCard, embedding: Vec<f32>) -> Self {
        Self {
            deliberation_id: representative.deliberation_id,
            title: representative.title.clone(),
            description: representative.description.clone(),
            policies: representative.policies.clone(),
            embedding,
            source_card_id: representative.id,
        }
    }
}

/// A deliberation-scoped context tag. The name is its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub deliberation_id: DeliberationId,
    pub name: String,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// A search hit with its cosine distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMatch<T> {
    pub entity: T,
    pub distance: f64,
}

/// Card submission as it arrives from the conversation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewValuesCard {
    pub deliberation_id: DeliberationId,
    #[serde(default)]
    pub chat_id: Option<String>,
    pub title: String,
    pub description: String,
    pub policies: Vec<String>,
}

impl NewValuesCard {
    /// Trims and checks a submission. Everything downstream assumes a card has
    /// a title, a description and at least one policy.
    pub fn validate(mut self) -> Result<Self> {
        self.title = self.title.trim().to_string();
        self.description = self.description.trim().to_string();
        self.policies = self
            .policies
            .into_iter()
            .map(|p| p.trim().to_string())
            .collect();

        if self.title.is_empty() {
            return Err(DedupError::Validation("title must not be empty".into()));
        }
        if self.title.chars().count() > MAX_TITLE_CHARS {
            return Err(DedupError::Validation(format!(
                "title exceeds {MAX_TITLE_CHARS} characters"
            )));
        }
        if self.description.is_empty() {
            return Err(DedupError::Validation(
                "description must not be empty".into(),
            ));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(DedupError::Validation(format!(
                "description exceeds {MAX_DESCRIPTION_CHARS} characters"
            )));
        }
        if self.policies.is_empty() {
            return Err(DedupError::Validation(
                "at least one policy is required".into(),
            ));
        }
        if self.policies.len() > MAX_POLICIES {
            return Err(DedupError::Validation(format!(
                "at most {MAX_POLICIES} policies are allowed"
            )));
        }
        if let Some(i) = self.policies.iter().position(|p| p.is_empty()) {
            return Err(DedupError::Validation(format!("policy {i} is empty")));
        }
        if self
            .policies
            .iter()
            .any(|p| p.chars().count() > MAX_POLICY_CHARS)
        {
            return Err(DedupError::Validation(format!(
                "policies must be at most {MAX_POLICY_CHARS} characters"
            )));
        }
        if self.deliberation_id <= 0 {
            return Err(DedupError::Validation(
                "deliberation_id must be positive".into(),
            ));
        }

        Ok(self)
    }
}

impl CardContent for NewValuesCard {
    fn title(&self) -> &str {
        &self.title
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn policies(&self) -> &[String] {
        &self.policies
    }
}

/// A card next to the canonical card it was merged into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalizationPair {
    pub card: ValuesCard,
    pub canonical: CanonicalValuesCard,
}

impl CanonicalizationPair {
    /// True when the card was merged into a canonical card with different
    /// wording, i.e. an actual deduplication rather than a promotion.
    pub fn differs(&self) -> bool {
        !self.card.same_content(&self.canonical)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliberationStats {
    pub deliberation_id: DeliberationId,
    pub total_cards: i64,
    pub canonicalized_cards: i64,
    pub canonical_cards: i64,
    pub contexts: i64,
}

impl DeliberationStats {
    pub fn pending_cards(&self) -> i64 {
        self.total_cards - self.canonicalized_cards
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    /// Out of attempts. Left for inspection; a new job can be enqueued.
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Dead => "DEAD",
        }
    }

    /// Pending, running and failed jobs still have work ahead of them.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "DONE" => Ok(JobStatus::Done),
            "FAILED" => Ok(JobStatus::Failed),
            "DEAD" => Ok(JobStatus::Dead),
            other => Err(DedupError::invariant(format!("unknown job status {other}"))),
        }
    }
}

/// One requested deduplication run for a deliberation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupJob {
    pub id: Uuid,
    pub deliberation_id: DeliberationId,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Earliest time the job may be claimed; while running, the lease expiry.
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub job: DedupJob,
    /// False when an active job for the deliberation already existed.
    pub newly_created: bool,
}
