use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tsync_core::{BlacklistEntry, SyncState, BLACKLIST_TIMESTAMP_FORMAT};
use tsync_store::SyncStore;
use tsync_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "tsync")]
#[command(about = "Incremental issue tracker sync into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over every project in the credentials file
    Sync,
    /// Create the blacklist and watermark tables
    Migrate,
    /// Inspect or edit the instance blacklist
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },
    /// Run syncs on the configured cron schedule until interrupted
    Schedule,
}

#[derive(Debug, Subcommand)]
enum BlacklistAction {
    List,
    Add {
        instance: String,
        #[arg(long, default_value = "Added manually")]
        reason: String,
    },
    /// Drop the blacklist table entirely
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(
            "tsync_sync=info,tsync_fetch=info,tsync_store=info,tsync_transform=info,tsync_cli=info",
        ),
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = tsync_sync::run_sync_once(&config).await?;
            println!(
                "sync complete: run_id={} projects={} advanced={} empty={} skipped={} failed={}",
                summary.run_id,
                summary.projects,
                summary.count(SyncState::WatermarkAdvanced),
                summary.count(SyncState::Empty),
                summary.count(SyncState::Skipped),
                summary.count(SyncState::Failed),
            );
            for outcome in &summary.outcomes {
                println!(
                    "  {}/{} {:<12} state={:?} fetched={} upserted={} allowed_fields={} \
                     watermark={}",
                    outcome.instance,
                    outcome.project_key,
                    outcome.record_type.as_deref().unwrap_or("-"),
                    outcome.state,
                    outcome.fetched,
                    outcome.upserted,
                    outcome.allowed_fields,
                    outcome.watermark.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Migrate => {
            tsync_sync::migrate(&config).await?;
            println!("migrated {}", config.database_url);
        }
        Commands::Blacklist { action } => {
            let store = SyncStore::connect(&config.database_url).await?;
            let blacklist = store.blacklist(config.blacklist_table.clone());
            match action {
                BlacklistAction::List => {
                    let entries = blacklist.entries().await?;
                    if entries.is_empty() {
                        println!("blacklist is empty");
                    }
                    for entry in entries {
                        println!(
                            "{}\t{}\t{}",
                            entry.instance,
                            entry.blacklisted_at,
                            entry.reason.as_deref().unwrap_or("")
                        );
                    }
                }
                BlacklistAction::Add { instance, reason } => {
                    let entry = BlacklistEntry {
                        instance,
                        reason: Some(reason),
                        blacklisted_at: Utc::now().format(BLACKLIST_TIMESTAMP_FORMAT).to_string(),
                    };
                    blacklist.append(&entry).await?;
                    println!("blacklisted {}", entry.instance);
                }
                BlacklistAction::Clear => {
                    blacklist.drop_table().await?;
                    println!("dropped {}", blacklist.table());
                }
            }
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let Some(sched) = tsync_sync::maybe_build_scheduler(&config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
