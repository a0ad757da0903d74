use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use values_dedup::pipeline::{enqueue_all, spawn_workers};
use values_dedup::storage::schema::{initialize_schema, missing_tables};
use values_dedup::{
    judge_from_config, Config, DedupScheduler, DeduplicationPipeline, EmbeddingService,
    NewValuesCard, PostgresStore, SimpleEmbedder,
};

#[derive(Parser)]
#[command(name = "values-dedup")]
#[command(about = "Deduplicate values cards into canonical cards per deliberation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hourly trigger and the job workers
    Serve,
    /// Deduplicate one deliberation now, bypassing the job queue
    Run {
        #[arg(long)]
        deliberation: i64,
    },
    /// Queue a deduplication job for every deliberation
    EnqueueAll,
    /// Submit values cards from a JSON file (one object or an array)
    Submit {
        #[arg(long)]
        file: PathBuf,
    },
    /// List cards that were merged into a differently worded canonical card
    Pairs {
        #[arg(long)]
        deliberation: Option<i64>,
    },
    /// Show card counts for a deliberation
    Stats {
        #[arg(long)]
        deliberation: i64,
    },
    /// Create the pgvector extension and tables
    InitDb,
    /// Print configuration and check connectivity
    Diagnose,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn build_pipeline(config: &Config) -> Result<(Arc<PostgresStore>, Arc<DeduplicationPipeline>)> {
    let store = Arc::new(PostgresStore::connect(&config.database_url, config.max_db_connections).await?);
    let embedder: Arc<dyn EmbeddingService> = Arc::new(SimpleEmbedder::from_config(&config.embedding)?);
    let judge = judge_from_config(&config.judge).context("Failed to create judge")?;
    let pipeline = DeduplicationPipeline::new(store.clone(), embedder, judge, config.dedup.clone());
    Ok((store, Arc::new(pipeline)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = Config::from_env()?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config).await,
        Commands::Run { deliberation } => {
            let (_store, pipeline) = build_pipeline(&config).await?;
            let report = pipeline.run_now(deliberation).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::EnqueueAll => {
            let (store, _pipeline) = build_pipeline(&config).await?;
            let summary = enqueue_all(store.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Submit { file } => submit(&config, &file).await,
        Commands::Pairs { deliberation } => {
            let (_store, pipeline) = build_pipeline(&config).await?;
            let pairs = pipeline.review_pairs(deliberation).await?;
            for pair in &pairs {
                println!(
                    "{}  {:?} -> {:?} ({})",
                    pair.card.created_at.format("%Y-%m-%d %H:%M"),
                    pair.card.title,
                    pair.canonical.title,
                    pair.canonical.id
                );
            }
            println!("{} merged cards with different wording", pairs.len());
            Ok(())
        }
        Commands::Stats { deliberation } => {
            let (_store, pipeline) = build_pipeline(&config).await?;
            let stats = pipeline.stats(deliberation).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            println!("pending: {}", stats.pending_cards());
            Ok(())
        }
        Commands::InitDb => {
            let store = PostgresStore::connect(&config.database_url, config.max_db_connections).await?;
            initialize_schema(store.pool()).await?;
            println!("Schema ready at {}", config.safe_database_url());
            Ok(())
        }
        Commands::Diagnose => diagnose(&config).await,
    }
}

async fn serve(config: &Config) -> Result<()> {
    let (store, pipeline) = build_pipeline(config).await?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let workers = if config.worker.enabled {
        spawn_workers(pipeline.clone(), &config.worker, &shutdown_tx)
    } else {
        info!("Workers disabled in configuration");
        Vec::new()
    };

    let mut scheduler = DedupScheduler::new(store, config.scheduler.clone()).await?;
    scheduler.start().await?;

    info!(workers = workers.len(), "values-dedup running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    scheduler.shutdown().await?;
    let _ = shutdown_tx.send(());
    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            error!(error = %e, "Worker task ended abnormally");
        }
    }
    Ok(())
}

async fn submit(config: &Config, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw).context("Submission is not valid JSON")?;
    let cards: Vec<NewValuesCard> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };

    let (_store, pipeline) = build_pipeline(config).await?;
    let mut rejected = 0;
    for (i, card) in cards.into_iter().enumerate() {
        match pipeline.submit_card(card).await {
            Ok(stored) => println!("stored {} in deliberation {}", stored.id, stored.deliberation_id),
            Err(e) => {
                rejected += 1;
                warn!(index = i, error = %e, "Rejected card");
            }
        }
    }

    if rejected > 0 {
        anyhow::bail!("{rejected} cards were rejected");
    }
    Ok(())
}

async fn diagnose(config: &Config) -> Result<()> {
    println!("{}", config.create_diagnostic_report());

    match PostgresStore::connect(&config.database_url, 1).await {
        Ok(store) => match missing_tables(store.pool()).await {
            Ok(missing) if missing.is_empty() => println!("Database: OK"),
            Ok(missing) => println!("Database: missing tables {} (run init-db)", missing.join(", ")),
            Err(e) => println!("Database: schema check failed: {e}"),
        },
        Err(e) => println!("Database: unreachable: {e}"),
    }

    match SimpleEmbedder::from_config(&config.embedding) {
        Ok(embedder) => match embedder.health_check().await {
            Ok(()) => println!("Embedding service: OK ({})", embedder.model()),
            Err(e) => println!("Embedding service: failed: {e}"),
        },
        Err(e) => println!("Embedding service: misconfigured: {e}"),
    }

    match judge_from_config(&config.judge) {
        Ok(_) => println!("Judge: configured ({} / {})", config.judge.provider, config.judge.model),
        Err(e) => println!("Judge: misconfigured: {e}"),
    }
    Ok(())
}
