//! `hserverctl`: operator commands against the case pipeline database.
//!
//! Every command prints one JSON document on stdout. Logs go to stderr.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;

use hserver_core::ActorId;
use hserver_core::logging::{init_json_subscriber, init_subscriber};
use hserver_settings::{HserverSettings, load_settings, load_settings_from_path};
use hserver_store::sqlite::{current_version, latest_version};
use hserver_store::{CreditCategory, Engine, HistoryFilter, LocalFileStorage, SortOrder};

#[derive(Debug, Parser)]
#[command(name = "hserverctl", about = "Operator commands for the case pipeline store")]
struct Cli {
    /// Settings file. Defaults to `$HSERVER_SETTINGS` or `~/.hserver/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Database file, overriding `database.path` from settings.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending schema migrations.
    Migrate,
    /// Print the committed balance and the low-balance signal.
    Balance,
    /// Add credit.
    Allocate {
        /// Units to add.
        #[arg(long)]
        quantity: i64,
        /// Who is allocating.
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Withdraw unused credit.
    Reclaim {
        /// Units to withdraw.
        #[arg(long)]
        quantity: i64,
        /// Who is withdrawing.
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Ledger history, newest first.
    History {
        /// Page size.
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Entries to skip.
        #[arg(long, default_value_t = 0)]
        offset: u32,
        /// Only this category (ALLOCATE, RUS_USE, REVOKE, RECLAIM).
        #[arg(long)]
        category: Option<CreditCategory>,
    },
    /// Storage used/free/total.
    Usage {
        /// Capacity in bytes. Defaults to `storage.totalCapacityBytes`.
        #[arg(long)]
        total: Option<u64>,
    },
    /// Retry queued file deletions.
    ReclaimFiles {
        /// Maximum entries to attempt.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Reject upload jobs that have been in progress past the timeout.
    ExpireJobs,
}

fn load(cli: &Cli) -> Result<HserverSettings> {
    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };
    if let Some(path) = &cli.db_path {
        settings.database.path = Some(path.to_string_lossy().into_owned());
    }
    Ok(settings)
}

fn run(cli: &Cli, settings: &HserverSettings) -> Result<Value> {
    let files = Arc::new(LocalFileStorage::new(&settings.storage.root_dir));
    let engine = Engine::open(settings, files).context("failed to open store")?;

    let output = match &cli.command {
        Command::Migrate => {
            let conn = engine.store().pool().get().context("no database connection")?;
            json!({
                "schemaVersion": current_version(&conn)?,
                "latest": latest_version(),
            })
        }
        Command::Balance => serde_json::to_value(engine.ledger().low_balance()?)?,
        Command::Allocate { quantity, actor } => {
            let entry = engine
                .ledger()
                .allocate(*quantity, Some(&ActorId::from(actor.as_str())))?;
            info!(entry_id = %entry.id, quantity, "allocated");
            json!({ "entry": entry, "balance": engine.ledger().balance()? })
        }
        Command::Reclaim { quantity, actor } => {
            let entry = engine
                .ledger()
                .reclaim(*quantity, Some(&ActorId::from(actor.as_str())))?;
            info!(entry_id = %entry.id, quantity, "reclaimed");
            json!({ "entry": entry, "balance": engine.ledger().balance()? })
        }
        Command::History {
            limit,
            offset,
            category,
        } => {
            let page = engine.ledger().history(&HistoryFilter {
                category: *category,
                limit: Some(*limit),
                offset: *offset,
                order: SortOrder::Descending,
                ..Default::default()
            })?;
            serde_json::to_value(page)?
        }
        Command::Usage { total } => {
            let usage = match total {
                Some(total) => engine.storage().usage(*total)?,
                None => engine.storage().usage_with_configured()?,
            };
            serde_json::to_value(usage)?
        }
        Command::ReclaimFiles { limit } => {
            serde_json::to_value(engine.artifacts().retry_reclamations(*limit)?)?
        }
        Command::ExpireJobs => {
            let expired = engine.uploads().expire_stale(chrono::Utc::now())?;
            info!(count = expired.len(), "expired stale upload jobs");
            json!({ "expired": expired })
        }
    };
    Ok(output)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    let output = run(&cli, &settings)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
