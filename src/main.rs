use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use adaptive_retrainer::config::{load_config, RuntimeConfig};
use adaptive_retrainer::database::Database;
use adaptive_retrainer::engine::{Clock, FeedbackLoop, SystemClock};
use adaptive_retrainer::feed::{Ingestor, JsonLinesSource, ObservationSource};
use adaptive_retrainer::ml::{
    BaselineTrainer, CommandTrainer, InMemoryModelStore, ModelRegistry, ModelStore, PredictionLog,
    SqliteModelStore, TimeoutTrainer, Trainer,
};
use adaptive_retrainer::notifications::LifecycleEvent;
use adaptive_retrainer::types::Tier;

#[derive(Parser)]
#[command(name = "adaptive-retrainer")]
#[command(version = "0.1.0")]
#[command(about = "Tiered retraining scheduler for prediction models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Keep models and predictions in memory only
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the feedback loop until interrupted
    Run {
        /// JSON-lines observation feed; `-` reads stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Show active models and recent lifecycle events
    Status {
        #[arg(short, long, default_value = "10")]
        events: usize,
    },
    /// List the stored versions of a tier's model
    Models {
        #[arg(short, long)]
        tier: Tier,
    },
    /// Make an older version the active model
    Rollback {
        #[arg(short, long)]
        tier: Tier,
        #[arg(long)]
        version: u64,
    },
    /// Delete all but the newest versions of a tier's model
    Cleanup {
        #[arg(short, long)]
        tier: Tier,
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        keep: Option<u64>,
    },
    /// Retrain one tier now and wait for the result
    Train {
        #[arg(short, long)]
        tier: Tier,
    },
}

struct Storage {
    database: Option<Arc<Database>>,
    registry: Arc<ModelRegistry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides --verbose
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if cli.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    info!("Adaptive Retrainer v0.1.0");

    let config = Arc::new(load_config(Some(&cli.config))?);
    let storage = open_storage(&config, cli.ephemeral).await?;

    match cli.command {
        Commands::Run { input } => run_loop(config, storage, input).await?,
        Commands::Status { events } => show_status(&config, &storage, events).await?,
        Commands::Models { tier } => list_models(&storage, tier).await?,
        Commands::Rollback { tier, version } => {
            let metadata = storage.registry.rollback(tier, version).await?;
            info!("{} now serves v{} (trained {})", tier, metadata.version, metadata.trained_at);
        }
        Commands::Cleanup { tier, keep } => {
            let keep = keep.map_or(config.storage.keep_versions, |k| k as usize);
            let removed = storage.registry.cleanup_old_versions(tier, keep).await?;
            info!("Removed {} old {} versions", removed, tier);
        }
        Commands::Train { tier } => train_once(config, storage, tier).await?,
    }

    Ok(())
}

async fn open_storage(config: &RuntimeConfig, ephemeral: bool) -> Result<Storage> {
    let (database, store): (Option<Arc<Database>>, Arc<dyn ModelStore>) = if ephemeral {
        info!("Ephemeral mode: nothing is written to disk");
        (None, Arc::new(InMemoryModelStore::new()))
    } else {
        let db = Arc::new(Database::new(&config.storage.database_url).await?);
        let store = SqliteModelStore::new(db.pool().clone(), &config.storage.models_dir).await?;
        (Some(db), Arc::new(store))
    };

    let registry = Arc::new(ModelRegistry::new(store));
    registry.load().await?;
    Ok(Storage { database, registry })
}

fn build_trainer(config: &RuntimeConfig) -> Arc<dyn Trainer> {
    let trainer: Arc<dyn Trainer> = match &config.trainer.command {
        Some(program) => {
            info!("Training with external command: {}", program);
            Arc::new(CommandTrainer::new(program.clone(), config.trainer.args.clone()))
        }
        None => Arc::new(BaselineTrainer::default()),
    };

    match config.trainer.timeout_secs {
        Some(secs) => Arc::new(TimeoutTrainer::new(trainer, Duration::from_secs(secs))),
        None => trainer,
    }
}

/// Rebuild the in-memory log from the prediction journal
async fn restore_log(config: &RuntimeConfig, database: Option<&Arc<Database>>) -> Result<Arc<PredictionLog>> {
    let log = Arc::new(PredictionLog::new());
    if let Some(db) = database {
        for tier in Tier::ALL {
            let records = db.load_predictions(tier, config.storage.max_records_per_tier).await?;
            let restored = log.restore(records);
            if restored > 0 {
                info!("Restored {} {} predictions", restored, tier);
            }
        }
    }
    Ok(log)
}

async fn start_loop(
    config: Arc<RuntimeConfig>,
    storage: &Storage,
    clock: Arc<dyn Clock>,
    scheduled: bool,
) -> Result<FeedbackLoop> {
    let log = restore_log(&config, storage.database.as_ref()).await?;
    let trainer = build_trainer(&config);
    let registry = Arc::clone(&storage.registry);
    let database = storage.database.clone();
    let feedback = if scheduled {
        FeedbackLoop::start(config, log, registry, trainer, clock, database).await
    } else {
        FeedbackLoop::start_manual(config, log, registry, trainer, clock, database).await
    };
    Ok(feedback)
}

async fn run_loop(config: Arc<RuntimeConfig>, storage: Storage, input: Option<PathBuf>) -> Result<()> {
    if let Some(db) = &storage.database {
        db.cleanup_old_data(config.storage.journal_retention_days).await?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let feedback = start_loop(Arc::clone(&config), &storage, Arc::clone(&clock), true).await?;

    let ingest = match input {
        Some(path) => {
            let mut source = open_source(&path).await?;
            let ingestor = Ingestor::new(Arc::clone(feedback.log()), storage.database.clone(), Arc::clone(&clock));
            Some(tokio::spawn(async move { ingestor.pump(source.as_mut()).await }))
        }
        None => None,
    };

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(task) = ingest {
        task.abort();
    }
    feedback.shutdown().await?;

    for tier in Tier::ALL {
        match storage.registry.cleanup_old_versions(tier, config.storage.keep_versions).await {
            Ok(0) => {}
            Ok(removed) => info!("Removed {} old {} versions", removed, tier),
            Err(e) => warn!("Version cleanup for {} failed: {}", tier, e),
        }
    }
    Ok(())
}

async fn open_source(path: &Path) -> Result<Box<dyn ObservationSource>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(JsonLinesSource::stdin()))
    } else {
        Ok(Box::new(JsonLinesSource::open(path).await?))
    }
}

async fn train_once(config: Arc<RuntimeConfig>, storage: Storage, tier: Tier) -> Result<()> {
    // Timers and sampling stay off so only the requested tier trains
    let feedback = start_loop(config, &storage, Arc::new(SystemClock), false).await?;
    let mut events = feedback.handle().subscribe();
    feedback.handle().trigger(tier).await?;

    let outcome = loop {
        let notification = events.recv().await?;
        match notification.event {
            LifecycleEvent::TrainingSucceeded { tier: t, version, duration_ms } if t == tier => {
                info!("{} v{} trained in {}ms", tier, version, duration_ms);
                break Ok(());
            }
            LifecycleEvent::TrainingFailed { tier: t, error } if t == tier => {
                break Err(anyhow!("{} training failed: {}", tier, error));
            }
            LifecycleEvent::TriggerDropped { tier: t, reason, .. } if t == tier => {
                break Err(anyhow!("{} trigger dropped: {}", tier, reason));
            }
            _ => {}
        }
    };

    feedback.shutdown().await?;
    outcome
}

async fn show_status(config: &RuntimeConfig, storage: &Storage, events: usize) -> Result<()> {
    info!("Profile: {}. {}", config.profile.name(), config.profile.description());
    info!("=== Active models ===");
    for tier in Tier::ALL {
        match storage.registry.active(tier).await {
            Some(active) => info!(
                "{:<13} v{:<4} trained {} on {} samples (accuracy {})",
                tier.as_str(),
                active.version,
                active.trained_at.format("%Y-%m-%d %H:%M:%S"),
                active.training_window_size,
                active
                    .metrics
                    .accuracy
                    .map(|a| format!("{:.1}%", a * 100.0))
                    .unwrap_or_else(|| "n/a".to_string()),
            ),
            None => info!("{:<13} no model", tier.as_str()),
        }
    }

    match &storage.database {
        Some(db) => {
            info!("Journaled predictions: {}", db.prediction_count().await?);
            info!("=== Recent events ===");
            for notification in db.get_recent_events(events).await? {
                info!(
                    "{} [{:?}] {}",
                    notification.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    notification.severity,
                    notification.event.title()
                );
            }
        }
        None => warn!("No journal in ephemeral mode"),
    }
    Ok(())
}

async fn list_models(storage: &Storage, tier: Tier) -> Result<()> {
    let active = storage.registry.active_version(tier).await;
    let history = storage.registry.history(tier).await?;
    if history.is_empty() {
        error!("No stored models for {}", tier);
        return Ok(());
    }

    for metadata in history {
        let marker = if Some(metadata.version) == active { "*" } else { " " };
        info!(
            "{} v{:<4} {} samples={} kinds={:?} digest={}",
            marker,
            metadata.version,
            metadata.trained_at.format("%Y-%m-%d %H:%M:%S"),
            metadata.training_window_size,
            metadata.model_kinds,
            &metadata.payload_digest[..12.min(metadata.payload_digest.len())],
        );
    }
    Ok(())
}
