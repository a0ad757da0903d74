use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{lease_expiry, CheckpointStore, JobStore, ScopeLeaseStore, ValuesStore};
use crate::error::{DedupError, Result};
use crate::models::{
    CanonicalValuesCard, CanonicalizationPair, Context, DedupJob, Deliberation, DeliberationId,
    DeliberationStats, Enqueued, NewCanonicalCard, NewValuesCard, ScoredMatch, ValuesCard,
};

const CARD_COLUMNS: &str =
    "id, deliberation_id, chat_id, title, description, policies, embedding, canonical_card_id, created_at";
const CANONICAL_COLUMNS: &str =
    "id, deliberation_id, title, description, policies, embedding, source_card_id, created_at";
const JOB_COLUMNS: &str =
    "id, deliberation_id, status, attempts, last_error, available_at, lease_owner, created_at, updated_at";

#[derive(FromRow)]
struct DeliberationRow {
    id: i64,
    title: String,
    created_at: DateTime<Utc>,
}

impl From<DeliberationRow> for Deliberation {
    fn from(row: DeliberationRow) -> Self {
        Deliberation {
            id: row.id,
            title: row.title,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct CardRow {
    id: Uuid,
    deliberation_id: i64,
    chat_id: Option<String>,
    title: String,
    description: String,
    policies: Vec<String>,
    embedding: Option<Vector>,
    canonical_card_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<CardRow> for ValuesCard {
    fn from(row: CardRow) -> Self {
        ValuesCard {
            id: row.id,
            deliberation_id: row.deliberation_id,
            chat_id: row.chat_id,
            title: row.title,
            description: row.description,
            policies: row.policies,
            embedding: row.embedding.map(|v| v.to_vec()),
            canonical_card_id: row.canonical_card_id,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct CanonicalRow {
    id: Uuid,
    deliberation_id: i64,
    title: String,
    description: String,
    policies: Vec<String>,
    embedding: Option<Vector>,
    source_card_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    #[sqlx(default)]
    distance: Option<f64>,
}

impl From<CanonicalRow> for CanonicalValuesCard {
    fn from(row: CanonicalRow) -> Self {
        CanonicalValuesCard {
            id: row.id,
            deliberation_id: row.deliberation_id,
            title: row.title,
            description: row.description,
            policies: row.policies,
            embedding: row.embedding.map(|v| v.to_vec()),
            source_card_id: row.source_card_id,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ContextRow {
    deliberation_id: i64,
    name: String,
    embedding: Option<Vector>,
    created_at: DateTime<Utc>,
    #[sqlx(default)]
    distance: Option<f64>,
}

impl From<ContextRow> for Context {
    fn from(row: ContextRow) -> Self {
        Context {
            deliberation_id: row.deliberation_id,
            name: row.name,
            embedding: row.embedding.map(|v| v.to_vec()),
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct PairRow {
    card_id: Uuid,
    card_deliberation_id: i64,
    card_chat_id: Option<String>,
    card_title: String,
    card_description: String,
    card_policies: Vec<String>,
    card_created_at: DateTime<Utc>,
    canonical_id: Uuid,
    canonical_title: String,
    canonical_description: String,
    canonical_policies: Vec<String>,
    canonical_source_card_id: Option<Uuid>,
    canonical_created_at: DateTime<Utc>,
}

impl From<PairRow> for CanonicalizationPair {
    fn from(row: PairRow) -> Self {
        CanonicalizationPair {
            card: ValuesCard {
                id: row.card_id,
                deliberation_id: row.card_deliberation_id,
                chat_id: row.card_chat_id,
                title: row.card_title,
                description: row.card_description,
                policies: row.card_policies,
                embedding: None,
                canonical_card_id: Some(row.canonical_id),
                created_at: row.card_created_at,
            },
            canonical: CanonicalValuesCard {
                id: row.canonical_id,
                deliberation_id: row.card_deliberation_id,
                title: row.canonical_title,
                description: row.canonical_description,
                policies: row.canonical_policies,
                embedding: None,
                source_card_id: row.canonical_source_card_id,
                created_at: row.canonical_created_at,
            },
        }
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    deliberation_id: i64,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    available_at: DateTime<Utc>,
    lease_owner: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for DedupJob {
    type Error = DedupError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(DedupJob {
            id: row.id,
            deliberation_id: row.deliberation_id,
            status: row.status.parse()?,
            attempts: row.attempts,
            last_error: row.last_error,
            available_at: row.available_at,
            lease_owner: row.lease_owner,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Keep error text stored on jobs bounded.
fn truncate_error(error: &str) -> String {
    const MAX_ERROR_CHARS: usize = 2_000;
    error.chars().take(MAX_ERROR_CHARS).collect()
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Some(Duration::from_secs(300)))
            .connect(database_url)
            .await?;

        // Test the connection
        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        info!(
            "Connected to PostgreSQL with {} max connections",
            max_connections
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_active_job(&self, deliberation_id: DeliberationId) -> Result<Option<DedupJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM dedup_jobs \
             WHERE deliberation_id = $1 AND status IN ('PENDING', 'RUNNING', 'FAILED')"
        ))
        .bind(deliberation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DedupJob::try_from).transpose()
    }
}

#[async_trait]
impl ValuesStore for PostgresStore {
    async fn create_deliberation(&self, title: &str) -> Result<Deliberation> {
        let row = sqlx::query_as::<_, DeliberationRow>(
            "INSERT INTO deliberations (title) VALUES ($1) RETURNING id, title, created_at",
        )
        .bind(title)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_deliberation(&self, id: DeliberationId) -> Result<Option<Deliberation>> {
        let row = sqlx::query_as::<_, DeliberationRow>(
            "SELECT id, title, created_at FROM deliberations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_deliberations(&self) -> Result<Vec<Deliberation>> {
        let rows = sqlx::query_as::<_, DeliberationRow>(
            "SELECT id, title, created_at FROM deliberations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_card(&self, card: NewValuesCard) -> Result<ValuesCard> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM deliberations WHERE id = $1)")
                .bind(card.deliberation_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(DedupError::NotFound {
                entity: "deliberation",
                id: card.deliberation_id.to_string(),
            });
        }

        let row = sqlx::query_as::<_, CardRow>(&format!(
            "INSERT INTO values_cards (id, deliberation_id, chat_id, title, description, policies) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {CARD_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(card.deliberation_id)
        .bind(&card.chat_id)
        .bind(&card.title)
        .bind(&card.description)
        .bind(&card.policies)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn fetch_non_canonicalized(
        &self,
        deliberation_id: DeliberationId,
        limit: usize,
    ) -> Result<Vec<ValuesCard>> {
        let rows = sqlx::query_as::<_, CardRow>(&format!(
            "SELECT {CARD_COLUMNS} FROM values_cards \
             WHERE deliberation_id = $1 AND canonical_card_id IS NULL \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(deliberation_id)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn fetch_cards_without_embedding(
        &self,
        deliberation_id: DeliberationId,
        limit: usize,
    ) -> Result<Vec<ValuesCard>> {
        let rows = sqlx::query_as::<_, CardRow>(&format!(
            "SELECT {CARD_COLUMNS} FROM values_cards \
             WHERE deliberation_id = $1 AND canonical_card_id IS NULL AND embedding IS NULL \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(deliberation_id)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_card_embedding(&self, card_id: Uuid, embedding: &[f32]) -> Result<()> {
        let result = sqlx::query("UPDATE values_cards SET embedding = $1 WHERE id = $2")
            .bind(Vector::from(embedding.to_vec()))
            .bind(card_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DedupError::NotFound {
                entity: "values card",
                id: card_id.to_string(),
            });
        }
        Ok(())
    }

    async fn link_cards(&self, canonical_id: Uuid, card_ids: &[Uuid]) -> Result<u64> {
        // Scope check and null-only update happen in one statement.
        let result = sqlx::query(
            r#"
            UPDATE values_cards v
            SET canonical_card_id = c.id
            FROM canonical_values_cards c
            WHERE c.id = $1
              AND v.deliberation_id = c.deliberation_id
              AND v.id = ANY($2)
              AND v.canonical_card_id IS NULL
            "#,
        )
        .bind(canonical_id)
        .bind(card_ids)
        .execute(&self.pool)
        .await?;

        debug!(
            "Linked {} of {} cards to canonical {}",
            result.rows_affected(),
            card_ids.len(),
            canonical_id
        );
        Ok(result.rows_affected())
    }

    async fn get_canonical(&self, id: Uuid) -> Result<Option<CanonicalValuesCard>> {
        let row = sqlx::query_as::<_, CanonicalRow>(&format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical_values_cards WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_canonical_by_source(
        &self,
        deliberation_id: DeliberationId,
        source_card_id: Uuid,
    ) -> Result<Option<CanonicalValuesCard>> {
        let row = sqlx::query_as::<_, CanonicalRow>(&format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical_values_cards \
             WHERE deliberation_id = $1 AND source_card_id = $2"
        ))
        .bind(deliberation_id)
        .bind(source_card_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_canonical(&self, card: NewCanonicalCard) -> Result<CanonicalValuesCard> {
        if card.embedding.is_empty() {
            return Err(DedupError::invariant(
                "canonical card cannot be stored without an embedding",
            ));
        }

        let inserted = sqlx::query_as::<_, CanonicalRow>(&format!(
            "INSERT INTO canonical_values_cards \
             (id, deliberation_id, title, description, policies, embedding, source_card_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (deliberation_id, source_card_id) DO NOTHING \
             RETURNING {CANONICAL_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(card.deliberation_id)
        .bind(&card.title)
        .bind(&card.description)
        .bind(&card.policies)
        .bind(Vector::from(card.embedding.clone()))
        .bind(card.source_card_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        warn!(
            "Canonical card for source {} already exists, reusing it",
            card.source_card_id
        );
        self.find_canonical_by_source(card.deliberation_id, card.source_card_id)
            .await?
            .ok_or_else(|| {
                DedupError::invariant(format!(
                    "insert for source {} conflicted but no row exists",
                    card.source_card_id
                ))
            })
    }

    async fn search_canonical(
        &self,
        deliberation_id: DeliberationId,
        embedding: &[f32],
        limit: usize,
        max_distance: f64,
    ) -> Result<Vec<ScoredMatch<CanonicalValuesCard>>> {
        let rows = sqlx::query_as::<_, CanonicalRow>(&format!(
            "SELECT {CANONICAL_COLUMNS}, (embedding <=> $2)::float8 AS distance \
             FROM canonical_values_cards \
             WHERE deliberation_id = $1 \
               AND embedding IS NOT NULL \
               AND (embedding <=> $2) <= $3 \
             ORDER BY embedding <=> $2 ASC, id ASC \
             LIMIT $4"
        ))
        .bind(deliberation_id)
        .bind(Vector::from(embedding.to_vec()))
        .bind(max_distance)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let distance = row.distance.ok_or_else(|| {
                    DedupError::invariant("similarity search row is missing its distance")
                })?;
                Ok(ScoredMatch {
                    entity: row.into(),
                    distance,
                })
            })
            .collect()
    }

    async fn list_contexts(&self, deliberation_id: DeliberationId) -> Result<Vec<Context>> {
        let rows = sqlx::query_as::<_, ContextRow>(
            "SELECT deliberation_id, name, embedding, created_at FROM contexts \
             WHERE deliberation_id = $1 ORDER BY name",
        )
        .bind(deliberation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn search_contexts(
        &self,
        deliberation_id: DeliberationId,
        embedding: &[f32],
        limit: usize,
        max_distance: f64,
    ) -> Result<Vec<ScoredMatch<Context>>> {
        let rows = sqlx::query_as::<_, ContextRow>(
            "SELECT deliberation_id, name, embedding, created_at, \
                    (embedding <=> $2)::float8 AS distance \
             FROM contexts \
             WHERE deliberation_id = $1 \
               AND embedding IS NOT NULL \
               AND (embedding <=> $2) <= $3 \
             ORDER BY embedding <=> $2 ASC, name ASC \
             LIMIT $4",
        )
        .bind(deliberation_id)
        .bind(Vector::from(embedding.to_vec()))
        .bind(max_distance)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let distance = row.distance.ok_or_else(|| {
                    DedupError::invariant("context search row is missing its distance")
                })?;
                Ok(ScoredMatch {
                    entity: row.into(),
                    distance,
                })
            })
            .collect()
    }

    async fn insert_context(
        &self,
        deliberation_id: DeliberationId,
        name: &str,
        embedding: &[f32],
    ) -> Result<Context> {
        sqlx::query(
            "INSERT INTO contexts (deliberation_id, name, embedding) VALUES ($1, $2, $3) \
             ON CONFLICT (deliberation_id, name) DO NOTHING",
        )
        .bind(deliberation_id)
        .bind(name)
        .bind(Vector::from(embedding.to_vec()))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, ContextRow>(
            "SELECT deliberation_id, name, embedding, created_at FROM contexts \
             WHERE deliberation_id = $1 AND name = $2",
        )
        .bind(deliberation_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn canonicalization_pairs(
        &self,
        deliberation_id: Option<DeliberationId>,
    ) -> Result<Vec<CanonicalizationPair>> {
        let rows = sqlx::query_as::<_, PairRow>(
            r#"
            SELECT
                v.id AS card_id,
                v.deliberation_id AS card_deliberation_id,
                v.chat_id AS card_chat_id,
                v.title AS card_title,
                v.description AS card_description,
                v.policies AS card_policies,
                v.created_at AS card_created_at,
                c.id AS canonical_id,
                c.title AS canonical_title,
                c.description AS canonical_description,
                c.policies AS canonical_policies,
                c.source_card_id AS canonical_source_card_id,
                c.created_at AS canonical_created_at
            FROM values_cards v
            JOIN canonical_values_cards c ON c.id = v.canonical_card_id
            WHERE ($1::bigint IS NULL OR v.deliberation_id = $1)
            ORDER BY v.created_at DESC
            "#,
        )
        .bind(deliberation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn stats(&self, deliberation_id: DeliberationId) -> Result<DeliberationStats> {
        let (total_cards, canonicalized_cards, canonical_cards, contexts): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM values_cards WHERE deliberation_id = $1),
                    (SELECT COUNT(*) FROM values_cards
                        WHERE deliberation_id = $1 AND canonical_card_id IS NOT NULL),
                    (SELECT COUNT(*) FROM canonical_values_cards WHERE deliberation_id = $1),
                    (SELECT COUNT(*) FROM contexts WHERE deliberation_id = $1)
                "#,
            )
            .bind(deliberation_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(DeliberationStats {
            deliberation_id,
            total_cards,
            canonicalized_cards,
            canonical_cards,
            contexts,
        })
    }
}

#[async_trait]
impl CheckpointStore for PostgresStore {
    async fn load_step(&self, job_id: Uuid, step_name: &str) -> Result<Option<serde_json::Value>> {
        let output: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT output FROM dedup_steps WHERE job_id = $1 AND step_name = $2",
        )
        .bind(job_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(output)
    }

    async fn save_step(
        &self,
        job_id: Uuid,
        step_name: &str,
        output: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO dedup_steps (job_id, step_name, output) VALUES ($1, $2, $3) \
             ON CONFLICT (job_id, step_name) DO NOTHING",
        )
        .bind(job_id)
        .bind(step_name)
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_steps(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM dedup_steps WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ScopeLeaseStore for PostgresStore {
    async fn try_acquire_scope_lease(
        &self,
        deliberation_id: DeliberationId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let acquired: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO scope_leases (deliberation_id, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (deliberation_id) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE scope_leases.expires_at <= $4 OR scope_leases.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(deliberation_id)
        .bind(holder)
        .bind(lease_expiry(now, ttl))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn release_scope_lease(&self, deliberation_id: DeliberationId, holder: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM scope_leases WHERE deliberation_id = $1 AND holder = $2")
            .bind(deliberation_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue_job(&self, deliberation_id: DeliberationId, now: DateTime<Utc>) -> Result<Enqueued> {
        // The active job can finish between the insert and the lookup, so try twice.
        for _ in 0..2 {
            let inserted = sqlx::query_as::<_, JobRow>(&format!(
                "INSERT INTO dedup_jobs \
                 (id, deliberation_id, status, attempts, available_at, created_at, updated_at) \
                 VALUES ($1, $2, 'PENDING', 0, $3, $3, $3) \
                 ON CONFLICT (deliberation_id) WHERE status IN ('PENDING', 'RUNNING', 'FAILED') \
                 DO NOTHING \
                 RETURNING {JOB_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(deliberation_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = inserted {
                return Ok(Enqueued {
                    job: row.try_into()?,
                    newly_created: true,
                });
            }

            if let Some(job) = self.find_active_job(deliberation_id).await? {
                return Ok(Enqueued {
                    job,
                    newly_created: false,
                });
            }
        }

        Err(DedupError::invariant(format!(
            "could not enqueue or find an active job for deliberation {deliberation_id}"
        )))
    }

    async fn claim_next_job(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<DedupJob>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM dedup_jobs \
             WHERE status IN ('PENDING', 'RUNNING', 'FAILED') AND available_at <= $1 \
             ORDER BY available_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let job = match row {
            Some(row) => {
                let lease_until = lease_expiry(now, lease);
                let claimed = sqlx::query_as::<_, JobRow>(&format!(
                    "UPDATE dedup_jobs \
                     SET status = 'RUNNING', available_at = $1, lease_owner = $2, updated_at = $3 \
                     WHERE id = $4 \
                     RETURNING {JOB_COLUMNS}"
                ))
                .bind(lease_until)
                .bind(owner)
                .bind(now)
                .bind(row.id)
                .fetch_one(&mut *tx)
                .await?;
                Some(DedupJob::try_from(claimed)?)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(job)
    }

    async fn mark_job_done(&self, job_id: Uuid, owner: Uuid, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dedup_jobs SET status = 'DONE', lease_owner = NULL, updated_at = $1 \
             WHERE id = $2 AND status = 'RUNNING' AND lease_owner = $3",
        )
        .bind(now)
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DedupError::LeaseLost { job_id });
        }
        Ok(())
    }

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        owner: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_jobs
            SET status = CASE WHEN $1::timestamptz IS NULL THEN 'DEAD' ELSE 'FAILED' END,
                attempts = attempts + 1,
                last_error = $2,
                available_at = COALESCE($1, available_at),
                lease_owner = NULL,
                updated_at = $3
            WHERE id = $4 AND status = 'RUNNING' AND lease_owner = $5
            "#,
        )
        .bind(retry_at)
        .bind(truncate_error(error))
        .bind(now)
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DedupError::LeaseLost { job_id });
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<DedupJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM dedup_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DedupJob::try_from).transpose()
    }
}
