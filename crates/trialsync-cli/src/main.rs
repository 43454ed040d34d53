use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trialsync_sync::{SnapshotOutcome, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "trialsync")]
#[command(about = "Clinical trials registry sync: fetch, normalize, diff and publish CSV snapshots")]
struct Cli {
    /// Directory holding the latest CSV snapshot.
    #[arg(long, global = true, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Directory receiving the previous generation of each file.
    #[arg(long, global = true, env = "ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,
    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run both pipelines once.
    Sync,
    /// Fetch and diff without writing, archiving or publishing.
    Plan,
    /// Run now, then on TRIALSYNC_SYNC_CRON until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.archive_dir {
        config.archive_dir = dir;
    }
    let command = cli.command.unwrap_or(Commands::Sync);
    info!(?command, data_dir = %config.data_dir.display(), "trialsync starting");
    let pipeline = SyncPipeline::new(config)?;

    match command {
        Commands::Sync => {
            let summary = pipeline.run_once().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} pages={} studies={} studies_changed={} version_changed={} published={} failed={}",
                    summary.run_id,
                    summary.studies.fetch.pages,
                    summary.studies.fetch.studies,
                    applied(summary.studies.snapshot.as_ref()),
                    applied(summary.version.snapshot.as_ref()),
                    summary.published_tables(),
                    summary.failed_publishes()
                );
                if let Some(reason) = &summary.studies.fetch.truncated {
                    eprintln!("warning: study feed truncated: {reason}");
                }
            }
        }
        Commands::Plan => {
            let plan = pipeline.plan().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                match &plan.studies {
                    Some(diff) if diff.any_changed() => {
                        println!("studies: would republish; changed tables: {:?}", diff.changed_tables())
                    }
                    Some(_) => println!("studies: no updates"),
                    None => println!("studies: feed unreachable, snapshot would be left alone"),
                }
                match (&plan.version, &plan.version_error) {
                    (Some(diff), _) if diff.any_changed() => println!("version: would republish"),
                    (Some(_), _) => println!("version: no updates"),
                    (None, Some(err)) => println!("version: skipped ({err})"),
                    (None, None) => println!("version: skipped"),
                }
            }
        }
        Commands::Schedule => {
            trialsync_sync::run_scheduled(Arc::new(pipeline)).await?;
        }
    }

    Ok(())
}

fn applied(outcome: Option<&SnapshotOutcome>) -> bool {
    outcome.is_some_and(|o| o.applied)
}
