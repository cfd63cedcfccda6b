//! driftsync CLI - Inspect and edit a driftsync store directory.
//!
//! The tool opens a file store offline, so everything it changes is picked
//! up by the next engine that opens the same directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use driftsync_common::{
    AnyModel, ModelId, ModelName, MutationEvent, QueryPredicate, QuerySortDescriptor,
};
use driftsync_storage::{FileStore, LocalStore, ModelRegistry};
use driftsync_sync::{Hub, MutationOutbox, SubmitOutcome, SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "driftsync")]
#[command(about = "driftsync - Offline outbox inspection and local writes")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Store directory.
    #[arg(short, long, global = true, default_value = ".driftsync")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending outbox events in send order.
    Outbox,

    /// List events that failed terminally.
    DeadLetters,

    /// Put a dead-lettered event back into the outbox.
    Requeue {
        /// Event id.
        id: String,
    },

    /// Drop a dead-lettered event for good.
    Discard {
        /// Event id.
        id: String,
    },

    /// Show the sync metadata of every known record.
    Metadata,

    /// Query records of a model.
    Query {
        /// Model name.
        #[arg(short, long)]
        model: String,

        /// Equality filter `field=value`; repeat to combine with AND.
        #[arg(short = 'w', long = "where")]
        filters: Vec<String>,

        /// Sort key `field`, `field:asc` or `field:desc`; repeatable.
        #[arg(long)]
        sort: Vec<String>,
    },

    /// Save a record locally and queue it for sync.
    Save {
        /// Model name.
        #[arg(short, long)]
        model: String,

        /// Record as a JSON object with an `id` field.
        #[arg(short, long)]
        json: String,
    },

    /// Delete a record locally and queue the deletion for sync.
    Delete {
        /// Model name.
        #[arg(short, long)]
        model: String,

        /// Record id.
        #[arg(short, long)]
        id: String,
    },

    /// Print the effective configuration.
    Config {
        /// Configuration file to load and validate.
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Outbox => cmd_outbox(&cli.store).await,
        Commands::DeadLetters => cmd_dead_letters(&cli.store).await,
        Commands::Requeue { id } => cmd_requeue(&cli.store, &id).await,
        Commands::Discard { id } => cmd_discard(&cli.store, &id).await,
        Commands::Metadata => cmd_metadata(&cli.store).await,
        Commands::Query {
            model,
            filters,
            sort,
        } => cmd_query(&cli.store, &model, &filters, &sort).await,
        Commands::Save { model, json } => cmd_save(&cli.store, &model, &json).await,
        Commands::Delete { model, id } => cmd_delete(&cli.store, &model, &id).await,
        Commands::Config { path } => cmd_config(path.as_deref()).await,
    }
}

async fn open_store(dir: &Path) -> Result<Arc<dyn LocalStore>> {
    let store = FileStore::open(dir)
        .await
        .with_context(|| format!("Failed to open store at {}", dir.display()))?;
    Ok(Arc::new(store))
}

async fn open_outbox(dir: &Path) -> Result<MutationOutbox> {
    let store = open_store(dir).await?;
    Ok(MutationOutbox::new(store, Arc::new(Hub::default())))
}

fn print_event(event: &MutationEvent) {
    let flags = match (event.in_process, event.condition_json.is_some()) {
        (true, true) => " [in process, conditional]",
        (true, false) => " [in process]",
        (false, true) => " [conditional]",
        (false, false) => "",
    };
    let version = event
        .version
        .map(|v| format!("v{}", v))
        .unwrap_or_else(|| "new".to_string());
    println!(
        "  {} {} {} {} ({}){}",
        event.id,
        event.mutation_type,
        event.model_name,
        event.model_id,
        version,
        flags
    );
    println!(
        "    queued {}",
        event.created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    );
}

/// List pending outbox events.
async fn cmd_outbox(dir: &Path) -> Result<()> {
    let outbox = open_outbox(dir).await?;
    let pending = outbox.pending().await.context("Failed to read outbox")?;

    if pending.is_empty() {
        println!("Outbox is empty.");
    } else {
        println!("{} pending event(s):", pending.len());
        for event in &pending {
            print_event(event);
        }
    }

    Ok(())
}

/// List dead letters.
async fn cmd_dead_letters(dir: &Path) -> Result<()> {
    let outbox = open_outbox(dir).await?;
    let dead_letters = outbox
        .dead_letters()
        .await
        .context("Failed to read dead letters")?;

    if dead_letters.is_empty() {
        println!("No dead letters.");
    } else {
        println!("{} dead letter(s):", dead_letters.len());
        for dead_letter in &dead_letters {
            print_event(&dead_letter.event);
            println!("    failed {}: {}", dead_letter.failed_at, dead_letter.error);
        }
    }

    Ok(())
}

/// Requeue a dead letter.
async fn cmd_requeue(dir: &Path, id: &str) -> Result<()> {
    info!("Requeueing dead letter {}", id);

    let outbox = open_outbox(dir).await?;
    let outcome = outbox
        .requeue_dead_letter(id)
        .await
        .context("Failed to requeue dead letter")?;

    match outcome {
        SubmitOutcome::Enqueued(event) => println!("Requeued as {}", event.id),
        SubmitOutcome::Merged(event) => println!("Merged into pending event {}", event.id),
        SubmitOutcome::Discarded => println!("Cancelled out with a pending create"),
    }

    Ok(())
}

/// Discard a dead letter.
async fn cmd_discard(dir: &Path, id: &str) -> Result<()> {
    info!("Discarding dead letter {}", id);

    let outbox = open_outbox(dir).await?;
    let dead_letter = outbox
        .discard_dead_letter(id)
        .await
        .context("Failed to discard dead letter")?;

    println!(
        "Discarded {} of {} {}",
        dead_letter.event.mutation_type, dead_letter.event.model_name, dead_letter.event.model_id
    );

    Ok(())
}

/// Show sync metadata.
async fn cmd_metadata(dir: &Path) -> Result<()> {
    let store = open_store(dir).await?;
    let metadata = store
        .all_sync_metadata()
        .await
        .context("Failed to read sync metadata")?;

    if metadata.is_empty() {
        println!("No synced records.");
    } else {
        for entry in metadata {
            let deleted = if entry.deleted { " [deleted]" } else { "" };
            println!(
                "  {} {} v{} changed {}{}",
                entry.model_name, entry.model_id, entry.version, entry.last_changed_at, deleted
            );
        }
    }

    Ok(())
}

/// Parse `field=value`. The value is read as JSON and falls back to a string.
fn parse_filter(filter: &str) -> Result<QueryPredicate> {
    let (field, raw) = filter
        .split_once('=')
        .with_context(|| format!("Invalid filter '{}', expected field=value", filter))?;
    if field.is_empty() {
        anyhow::bail!("Filter field cannot be empty");
    }
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok(QueryPredicate::field(field).eq(value))
}

/// Query records.
async fn cmd_query(dir: &Path, model: &str, filters: &[String], sort: &[String]) -> Result<()> {
    let model_name = ModelName::new(model).context("Invalid model name")?;

    let predicate = filters
        .iter()
        .map(|f| parse_filter(f))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .reduce(QueryPredicate::and);
    let sort = sort
        .iter()
        .map(|s| QuerySortDescriptor::parse(s))
        .collect::<driftsync_common::Result<Vec<_>>>()
        .context("Invalid sort key")?;

    let store = open_store(dir).await?;
    let models = store
        .query(&model_name, predicate.as_ref(), &sort)
        .await
        .context("Query failed")?;

    for model in &models {
        println!("{}", model.to_json()?);
    }
    info!("{} record(s)", models.len());

    Ok(())
}

async fn open_engine(dir: &Path) -> Result<SyncEngine> {
    let store = open_store(dir).await?;
    SyncEngine::new(store, ModelRegistry::new(), SyncConfig::default())
        .context("Failed to create sync engine")
}

/// Save a record.
async fn cmd_save(dir: &Path, model: &str, json: &str) -> Result<()> {
    let model_name = ModelName::new(model).context("Invalid model name")?;
    let record = AnyModel::from_json(model_name, json).context("Invalid record")?;

    let engine = open_engine(dir).await?;
    let event = engine.save(record, None).await.context("Save failed")?;

    println!("Queued {} of {} {}", event.mutation_type, event.model_name, event.model_id);

    Ok(())
}

/// Delete a record.
async fn cmd_delete(dir: &Path, model: &str, id: &str) -> Result<()> {
    let model_name = ModelName::new(model).context("Invalid model name")?;
    let model_id = ModelId::new(id).context("Invalid record id")?;

    let engine = open_engine(dir).await?;
    match engine
        .delete(&model_name, &model_id, None)
        .await
        .context("Delete failed")?
    {
        Some(event) => println!("Queued delete of {} {}", event.model_name, event.model_id),
        None => println!("No {} with id {}", model_name, model_id),
    }

    Ok(())
}

/// Print configuration.
async fn cmd_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(path) => SyncConfig::load(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => SyncConfig::default(),
    };

    println!("{}", config.to_json()?);

    Ok(())
}
