//! Run command handlers
//!
//! Starting runs, fetching their results and keeping the local run history
//! and output tree tidy.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use consort_core::domain::run::Run;
use consort_core::dto::run::{RemoteRunChange, StartRun};
use consort_runner::Session;
use consort_runner::repository::{ConsortiumRepository, RunRepository};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use super::read_json;
use crate::output::{colorize_status, print_run_summary};

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// Start a run described by a JSON request and follow it to the end
    Start {
        /// File holding the consortium, run and optional data mappings
        request: PathBuf,

        /// Gather data mappings from the local collections instead of the request
        #[arg(long)]
        gather: bool,

        /// Suspend the run on Ctrl-C instead of stopping it
        #[arg(long)]
        suspend_on_interrupt: bool,
    },
    /// Start a local run of a stored consortium's active pipeline
    Local {
        consortium_id: String,

        /// Let computation containers reach the network
        #[arg(long)]
        network: bool,
    },
    /// List the local run history
    List,
    /// Download and unpack a run's result bundle
    DownloadAssets {
        run_id: String,

        /// Bearer token for the API server
        #[arg(long, env = "CONSORT_AUTH_TOKEN")]
        token: String,
    },
    /// Link completed run outputs into the browsable runs tree
    Mirror,
    /// Remove staged and engine scratch files of a run
    Clean { run_id: String },
    /// Apply a run change pushed by the remote side
    Reconcile {
        /// File holding the remote run change
        change: PathBuf,

        /// Ids of runs the remote side reports as suspended
        #[arg(long = "suspended")]
        suspended: Vec<String>,
    },
}

pub async fn handle_run_command(command: RunCommands, session: &Session) -> Result<()> {
    match command {
        RunCommands::Start {
            request,
            gather,
            suspend_on_interrupt,
        } => start_run(session, &request, gather, suspend_on_interrupt).await,
        RunCommands::Local {
            consortium_id,
            network,
        } => start_local_run(session, &consortium_id, network).await,
        RunCommands::List => list_runs(session).await,
        RunCommands::DownloadAssets { run_id, token } => {
            download_assets(session, &run_id, &token).await
        }
        RunCommands::Mirror => mirror(session).await,
        RunCommands::Clean { run_id } => {
            session.controller().clean_run(&run_id).await;
            println!("{} Cleaned run {}", "✓".green(), run_id.dimmed());
            Ok(())
        }
        RunCommands::Reconcile { change, suspended } => {
            reconcile(session, &change, suspended).await
        }
    }
}

async fn start_run(
    session: &Session,
    path: &Path,
    gather: bool,
    suspend_on_interrupt: bool,
) -> Result<()> {
    let mut request: StartRun = read_json(path).await?;
    if gather {
        request.data_mappings = session
            .mapping()
            .collection_files(&request.consortium.id)
            .await?;
    }

    follow_run(session, request, suspend_on_interrupt).await
}

async fn start_local_run(session: &Session, consortium_id: &str, network: bool) -> Result<()> {
    let consortium = ConsortiumRepository::get(session.store().as_ref(), consortium_id)
        .await?
        .with_context(|| format!("Consortium {} is not stored locally", consortium_id))?;
    let snapshot = consortium
        .active_pipeline()
        .with_context(|| format!("Consortium {} has no active pipeline", consortium.name))?;
    let data_mappings = session.mapping().collection_files(consortium_id).await?;

    let request = StartRun {
        run: Run::local(consortium_id, snapshot),
        consortium,
        data_mappings,
        network_volume: network,
    };
    follow_run(session, request, false).await
}

/// Drives a run to its end; Ctrl-C stops or suspends it
async fn follow_run(
    session: &Session,
    request: StartRun,
    suspend_on_interrupt: bool,
) -> Result<()> {
    let run_id = request.run.id.clone();
    let pipeline_id = request.run.pipeline_snapshot().id.clone();
    info!("Starting run {} of {}", run_id, request.consortium.name);

    let controller = session.controller();
    let mut handle = controller.start_run(request);

    let run = tokio::select! {
        run = &mut handle => run.context("Run task failed")?,
        _ = tokio::signal::ctrl_c() => {
            if suspend_on_interrupt {
                println!("{}", "Suspending run...".yellow());
                controller.suspend_run(&run_id).await;
            } else {
                println!("{}", "Stopping run...".yellow());
                controller.stop_run(&pipeline_id, &run_id).await;
            }
            handle.await.context("Run task failed")?
        }
    };

    println!();
    println!(
        "{} {}",
        "Run finished locally as".bold(),
        colorize_status(run.status)
    );
    if let Some(results) = &run.results {
        println!("{}", serde_json::to_string_pretty(results)?);
    }
    Ok(())
}

async fn list_runs(session: &Session) -> Result<()> {
    let runs = RunRepository::list(session.store().as_ref()).await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in &runs {
            print_run_summary(run);
        }
    }
    Ok(())
}

async fn download_assets(session: &Session, run_id: &str, token: &str) -> Result<()> {
    let dir = session
        .controller()
        .download_run_assets(run_id, token)
        .await?;
    println!(
        "{} Assets of run {} in {}",
        "✓".green(),
        run_id.dimmed(),
        dir.display()
    );
    Ok(())
}

async fn mirror(session: &Session) -> Result<()> {
    let links = session.mirror_outputs().await?;

    if links.is_empty() {
        println!("{}", "Output tree already up to date.".yellow());
    } else {
        println!("{}", format!("Linked {} file(s):", links.len()).bold());
        for link in links {
            println!("  {}", link.display());
        }
    }
    Ok(())
}

async fn reconcile(session: &Session, path: &Path, suspended: Vec<String>) -> Result<()> {
    let change: RemoteRunChange = read_json(path).await?;
    let suspended: HashSet<String> = suspended.into_iter().collect();

    match session.history().reconcile(change, &suspended).await? {
        Some(run) => print_run_summary(&run),
        None => println!("{}", "Run removed from local history.".yellow()),
    }
    Ok(())
}
