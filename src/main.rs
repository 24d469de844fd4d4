#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod attachments;
mod cli;
mod config;
mod db;
mod events;
mod notify;
mod services;
mod snowflake;
mod sync;
mod upstream;
mod utils;

#[cfg(test)]
mod test_support;

use attachments::{AttachmentPipeline, AttachmentStorage, DownloadWorker, HttpFileSource, Reconciler};
use cli::{Cli, Commands};
use config::Config;
use db::DatabaseManager;
use events::{EventHandler, KeyedQueue};
use notify::Notifier;
use services::Services;
use snowflake::Snowflake;
use sync::{CheckpointTracker, SyncCoordinator, SyncSettings};
use upstream::HttpUpstream;

const STATUS_PROBLEM_LIMIT: i64 = 20;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    utils::logging::init_tracing(&config.logging);

    let command = cli.command.unwrap_or(Commands::Sync {
        communities: Vec::new(),
    });
    if command == Commands::ValidateConfig {
        println!("configuration in {} is valid", cli.config.display());
        return Ok(());
    }

    let db = DatabaseManager::new(&config.database).await?;
    db.migrate().await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, beginning shutdown");
            shutdown.cancel();
        }
    });

    match command {
        Commands::Sync { communities } => run_sync(&config, &db, communities, &cancel).await,
        Commands::Worker => {
            let pipeline = build_pipeline(&config, &db)?;
            let reconciler = Reconciler::from_days(
                db.attachment_store(),
                pipeline.storage().clone(),
                config.attachments.orphan_retention_days,
            );
            let worker = DownloadWorker::new(
                pipeline,
                db.attachment_store(),
                db.message_store(),
                db.channel_store(),
                &config.attachments,
            )
            .with_reconciler(reconciler);
            worker.run(cancel).await?;
            Ok(())
        }
        Commands::Cleanup { dry_run } => {
            let reconciler = Reconciler::from_days(
                db.attachment_store(),
                AttachmentStorage::new(config.attachments.storage_path.clone()),
                config.attachments.orphan_retention_days,
            );
            let report = reconciler.run(dry_run).await?;
            println!("{report}");
            for err in &report.errors {
                println!("  {err}");
            }
            Ok(())
        }
        Commands::Ingest { input } => {
            let handler = Arc::new(EventHandler::new(
                Services::new(&db),
                Notifier::from_config(&config.notifications)?,
            ));
            let queue = KeyedQueue::new();
            let report = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    events::ingest_lines(BufReader::new(file), handler, &queue, &cancel).await?
                }
                None => {
                    let stdin = BufReader::new(tokio::io::stdin());
                    events::ingest_lines(stdin, handler, &queue, &cancel).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed > 0 || report.malformed > 0 {
                bail!(
                    "{} event(s) failed and {} were malformed",
                    report.failed,
                    report.malformed
                );
            }
            Ok(())
        }
        Commands::Status => {
            let checkpoints = CheckpointTracker::new(db.checkpoint_store()).list().await?;
            let attachments = Services::new(&db).attachments;
            let counts = attachments.status_counts().await?;
            let problems = attachments.problems(STATUS_PROBLEM_LIMIT).await?;
            print!("{}", cli::render_status(&checkpoints, &counts, &problems));
            Ok(())
        }
        Commands::Pause { entity, id } => {
            let checkpoint = CheckpointTracker::new(db.checkpoint_store())
                .pause(entity.key(id))
                .await?;
            println!("{} is now {}", checkpoint.key, checkpoint.status);
            Ok(())
        }
        Commands::Resume { entity, id } => {
            let checkpoint = CheckpointTracker::new(db.checkpoint_store())
                .resume(entity.key(id))
                .await?;
            println!("{} is now {}", checkpoint.key, checkpoint.status);
            Ok(())
        }
        Commands::ValidateConfig => Ok(()),
    }
}

fn build_pipeline(config: &Config, db: &DatabaseManager) -> Result<Arc<AttachmentPipeline>> {
    let source = HttpFileSource::new(&config.upstream.user_agent)?;
    Ok(Arc::new(AttachmentPipeline::new(
        db.attachment_store(),
        Arc::new(source),
        &config.attachments,
        Notifier::from_config(&config.notifications)?,
    )))
}

async fn run_sync(
    config: &Config,
    db: &DatabaseManager,
    communities: Vec<Snowflake>,
    cancel: &CancellationToken,
) -> Result<()> {
    let ids = if communities.is_empty() {
        config.sync.communities.clone()
    } else {
        communities
    };
    if ids.is_empty() {
        bail!("no communities given on the command line or in sync.communities");
    }

    let coordinator = SyncCoordinator::new(
        Arc::new(HttpUpstream::new(&config.upstream)?),
        Services::new(db),
        CheckpointTracker::new(db.checkpoint_store()),
        build_pipeline(config, db)?,
        Notifier::from_config(&config.notifications)?,
        SyncSettings::from_config(&config.sync),
    );

    let mut failed = 0;
    for (id, result) in coordinator.sync_communities(&ids, cancel).await {
        match result {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(err) => {
                error!("community {} did not sync: {}", id, err);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} community sync(s) did not complete", ids.len());
    }
    info!("all {} community sync(s) completed", ids.len());
    Ok(())
}
