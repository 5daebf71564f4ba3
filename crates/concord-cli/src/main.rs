//! concord: operator tool for the entity resolution engine.
//!
//! Wires the PostgreSQL stores, the optional Redis cache and the inference
//! backends into a [`ResolutionEngine`] for one tenant, runs a single
//! operation and prints the result.
//!
//! Environment variables:
//!   DATABASE_URL          - PostgreSQL connection string (required)
//!   REDIS_URL             - Redis URL for the score and reject caches
//!   REDIS_ENABLED         - "false" to run without the cache
//!   CONCORD_INFERENCE     - "false" to run lexical-only without Ollama
//!   CONCORD_LOG_FORMAT    - "json" or "text" (default: "text")
//!   CONCORD_LOG_FILE      - path to log file (optional, daily rotation)
//!   RUST_LOG              - standard env filter (default: "concord=info")

mod output;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use concord_db::{Database, RedisCache};
use concord_engine::{
    CancelSignal, EngineConfig, PipelineContext, ReevaluateOptions, ResolutionEngine,
};
use concord_inference::{HttpCrossEncoder, OllamaBackend, RerankConfig};

use output::Printer;

#[derive(Parser)]
#[command(name = "concord")]
#[command(author, version, about = "Entity resolution and merge engine")]
#[command(propagate_version = true)]
struct Cli {
    /// Tenant to operate on
    #[arg(long, global = true, env = "CONCORD_TENANT", default_value = "default")]
    tenant: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    #[command(flatten)]
    Engine(EngineCommand),
}

/// Commands that run against a wired engine.
#[derive(Subcommand)]
enum EngineCommand {
    /// Resolve one concept against the rest of the tenant
    Resolve {
        /// Concept to resolve
        concept_id: Uuid,
    },

    /// Run batch resolution over every active concept
    CorpusRun {
        /// Score and route without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-score pending deferred candidates
    Reevaluate {
        /// Only entries with at least this many combined documents
        #[arg(long)]
        min_docs: Option<i64>,

        /// Maximum entries to evaluate
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Inspect and apply corpus-run merge proposals
    Proposals {
        #[command(subcommand)]
        command: ProposalCommands,
    },

    /// Undo a merge
    Rollback {
        /// Merge audit record to undo
        merge_id: Uuid,

        /// Operator performing the rollback
        #[arg(long)]
        by: Option<String>,
    },

    /// Show the surviving concept a concept was merged into
    Root {
        concept_id: Uuid,
    },

    /// Show concept, proposal, merge and queue counters
    Stats,
}

#[derive(Subcommand)]
enum ProposalCommands {
    /// List pending proposals, highest score first
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Execute a pending proposal
    Apply {
        /// Proposal id
        id: Uuid,

        /// Operator approving the merge
        #[arg(long)]
        by: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Install the tracing subscriber. The returned guard flushes the file
/// writer on drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("CONCORD_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("CONCORD_LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "concord=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("concord.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
        }
        Some(guard)
    } else {
        // Logs go to stderr so stdout stays clean for --json output.
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        None
    };

    tracing::debug!(
        subsystem = "cli",
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let printer = Printer::new(cli.json);
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = Database::connect(&database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    match cli.command {
        Commands::Migrate => {
            db.migrate().await.context("migration failed")?;
            info!(subsystem = "cli", op = "migrate", "Migrations applied");
            printer.message("migrations applied")
        }
        Commands::Engine(command) => {
            let engine = build_engine(db, &cli.tenant).await?;
            execute(&engine, command, &printer).await
        }
    }
}

async fn execute(
    engine: &ResolutionEngine,
    command: EngineCommand,
    printer: &Printer,
) -> anyhow::Result<()> {
    let cancel = cancel_on_ctrl_c();

    match command {
        EngineCommand::Resolve { concept_id } => {
            let report = engine.resolve_concept(concept_id, &cancel).await?;
            printer.report(&report)
        }
        EngineCommand::CorpusRun { dry_run } => {
            let report = engine.run_corpus(dry_run, &cancel).await?;
            printer.report(&report)
        }
        EngineCommand::Reevaluate { min_docs, limit } => {
            let options = ReevaluateOptions { min_docs, limit };
            let report = engine.reevaluate_deferred(options, &cancel).await?;
            printer.report(&report)
        }
        EngineCommand::Proposals { command } => match command {
            ProposalCommands::List { limit } => {
                let proposals = engine.pending_proposals(limit).await?;
                printer.proposals(&proposals)
            }
            ProposalCommands::Apply { id, by } => {
                let result = engine.apply_proposal(id, &by).await?;
                printer.merge(&result)?;
                if !result.success {
                    bail!(
                        "merge failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
                Ok(())
            }
        },
        EngineCommand::Rollback { merge_id, by } => {
            let record = engine.rollback_merge(merge_id, by.as_deref()).await?;
            printer.rollback(&record)
        }
        EngineCommand::Root { concept_id } => {
            let root = engine.resolve_root(concept_id).await?;
            printer.concept(&root)
        }
        EngineCommand::Stats => {
            let stats = engine.stats().await?;
            printer.stats(&stats)
        }
    }
}

/// Build the engine over the PostgreSQL stores plus whatever optional
/// backends the environment configures.
async fn build_engine(db: Database, tenant: &str) -> anyhow::Result<ResolutionEngine> {
    let config = EngineConfig::from_env().with_tenant(tenant);

    let mut ctx = PipelineContext::new(
        Arc::new(db.graph.clone()),
        Arc::new(db.deferred.clone()),
        Arc::new(db.proposals.clone()),
        Arc::new(db.audit.clone()),
    )
    .with_vectors(Arc::new(db.vectors.clone()));

    let cache = RedisCache::from_env().await;
    if cache.is_connected().await {
        ctx = ctx.with_cache(Arc::new(cache));
    }

    let inference_enabled = std::env::var("CONCORD_INFERENCE")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    if inference_enabled {
        let ollama = Arc::new(OllamaBackend::from_env().context("invalid Ollama configuration")?);
        ctx = ctx.with_embedder(ollama.clone()).with_generation(ollama);
    } else {
        warn!(
            subsystem = "cli",
            "Inference disabled via CONCORD_INFERENCE=false, scoring is lexical-only"
        );
    }

    let rerank = HttpCrossEncoder::from_config(&RerankConfig::from_env())
        .context("invalid cross-encoder configuration")?;
    if let Some(cross_encoder) = rerank {
        ctx = ctx.with_cross_encoder(Arc::new(cross_encoder));
    }

    Ok(ResolutionEngine::new(ctx, config)?)
}

/// A signal that fires on the first Ctrl-C. Runs stop between pairs.
fn cancel_on_ctrl_c() -> CancelSignal {
    let (handle, signal) = CancelSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(subsystem = "cli", "Interrupt received, stopping after the current pair");
            handle.cancel();
        }
    });
    signal
}
