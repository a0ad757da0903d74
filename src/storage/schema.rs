use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

/// Schema statements, applied in order. Each one is idempotent.
const SCHEMA: &[(&str, &str)] = &[
    ("pgvector extension", "CREATE EXTENSION IF NOT EXISTS vector"),
    (
        "deliberations",
        r#"
        CREATE TABLE IF NOT EXISTS deliberations (
            id BIGSERIAL PRIMARY KEY,
            title TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "canonical_values_cards",
        r#"
        CREATE TABLE IF NOT EXISTS canonical_values_cards (
            id UUID PRIMARY KEY,
            deliberation_id BIGINT NOT NULL REFERENCES deliberations(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            policies TEXT[] NOT NULL,
            embedding vector NOT NULL,
            source_card_id UUID,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (deliberation_id, source_card_id)
        )
        "#,
    ),
    (
        "values_cards",
        r#"
        CREATE TABLE IF NOT EXISTS values_cards (
            id UUID PRIMARY KEY,
            deliberation_id BIGINT NOT NULL REFERENCES deliberations(id) ON DELETE CASCADE,
            chat_id TEXT,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            policies TEXT[] NOT NULL,
            embedding vector,
            canonical_card_id UUID REFERENCES canonical_values_cards(id),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "values_cards pending index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_values_cards_pending
        ON values_cards (deliberation_id, created_at)
        WHERE canonical_card_id IS NULL
        "#,
    ),
    (
        "contexts",
        r#"
        CREATE TABLE IF NOT EXISTS contexts (
            deliberation_id BIGINT NOT NULL REFERENCES deliberations(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            embedding vector,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (deliberation_id, name)
        )
        "#,
    ),
    (
        "dedup_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS dedup_jobs (
            id UUID PRIMARY KEY,
            deliberation_id BIGINT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            available_at TIMESTAMPTZ NOT NULL,
            lease_owner UUID,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "dedup_jobs active index",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_dedup_jobs_active
        ON dedup_jobs (deliberation_id)
        WHERE status IN ('PENDING', 'RUNNING', 'FAILED')
        "#,
    ),
    (
        "dedup_jobs available index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_dedup_jobs_available
        ON dedup_jobs (available_at)
        WHERE status IN ('PENDING', 'RUNNING', 'FAILED')
        "#,
    ),
    (
        "dedup_steps",
        r#"
        CREATE TABLE IF NOT EXISTS dedup_steps (
            job_id UUID NOT NULL,
            step_name TEXT NOT NULL,
            output JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (job_id, step_name)
        )
        "#,
    ),
    (
        "scope_leases",
        r#"
        CREATE TABLE IF NOT EXISTS scope_leases (
            deliberation_id BIGINT PRIMARY KEY,
            holder UUID NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
];

/// Create the pgvector extension and every table the pipeline uses.
pub async fn initialize_schema(pool: &PgPool) -> Result<()> {
    for (name, statement) in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create {name}"))?;
    }

    info!("Database schema ready ({} statements applied)", SCHEMA.len());
    Ok(())
}

/// Tables checked by the diagnose command.
pub const REQUIRED_TABLES: &[&str] = &[
    "deliberations",
    "values_cards",
    "canonical_values_cards",
    "contexts",
    "dedup_jobs",
    "dedup_steps",
    "scope_leases",
];

/// Names of required tables that do not exist yet.
pub async fn missing_tables(pool: &PgPool) -> Result<Vec<String>> {
    let present: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables WHERE table_schema = current_schema()",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list tables")?;

    Ok(REQUIRED_TABLES
        .iter()
        .filter(|t| !present.iter().any(|p| p == *t))
        .map(|t| t.to_string())
        .collect())
}
