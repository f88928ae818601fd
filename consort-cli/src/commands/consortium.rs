//! Consortium command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use consort_core::domain::consortium::{Consortium, StepIo};
use consort_core::domain::pipeline::PipelineStep;
use consort_runner::Session;
use consort_runner::repository::ConsortiumRepository;
use std::path::PathBuf;

use super::read_json;

/// Consortium subcommands
#[derive(Subcommand)]
pub enum ConsortiumCommands {
    /// List consortia stored locally
    List,
    /// Check whether a consortium's mapping is complete
    Check { id: String },
    /// Record mapping choices from a stepIO JSON file
    Map { id: String, step_io: PathBuf },
    /// Forget a consortium's mapping
    Unmap {
        id: String,

        /// Remove the consortium entirely
        #[arg(long)]
        delete: bool,
    },
    /// Apply a consortium record pushed by the remote side
    Sync { consortium: PathBuf },
    /// Apply an edited pipeline to every consortium using it
    SyncPipeline { pipeline_id: String, steps: PathBuf },
}

pub async fn handle_consortium_command(
    command: ConsortiumCommands,
    session: &Session,
) -> Result<()> {
    match command {
        ConsortiumCommands::List => list(session).await,
        ConsortiumCommands::Check { id } => check(session, &id).await,
        ConsortiumCommands::Map { id, step_io } => {
            let step_io: StepIo = read_json(&step_io).await?;
            let resolution = session.mapping().save_mapping(&id, step_io).await?;
            println!(
                "{} Mapping of {} complete, {} collection(s) used",
                "✓".green(),
                id.cyan(),
                resolution.collection_ids().len()
            );
            Ok(())
        }
        ConsortiumCommands::Unmap { id, delete } => {
            session.mapping().unmap(&id, delete).await?;
            let verb = if delete { "Removed" } else { "Unmapped" };
            println!("{} {} {}", "✓".green(), verb, id.cyan());
            Ok(())
        }
        ConsortiumCommands::Sync { consortium } => {
            let remote: Consortium = read_json(&consortium).await?;
            let id = remote.id.clone();
            session.mapping().sync_remote_consortium(remote).await?;
            println!("{} Synced {}", "✓".green(), id.cyan());
            Ok(())
        }
        ConsortiumCommands::SyncPipeline { pipeline_id, steps } => {
            let steps: Vec<PipelineStep> = read_json(&steps).await?;
            session
                .mapping()
                .sync_remote_pipeline(&pipeline_id, steps)
                .await?;
            println!("{} Synced pipeline {}", "✓".green(), pipeline_id.cyan());
            Ok(())
        }
    }
}

async fn list(session: &Session) -> Result<()> {
    let consortia = ConsortiumRepository::list(session.store().as_ref()).await?;

    if consortia.is_empty() {
        println!("{}", "No consortia found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} consortia:", consortia.len()).bold());
    println!();
    for consortium in consortia {
        let mapped = if consortium.is_mapped {
            "mapped".green()
        } else {
            "unmapped".yellow()
        };
        println!("  {} {} ({})", "▸".cyan(), consortium.name, consortium.id.dimmed());
        println!(
            "    Pipeline: {}",
            consortium.active_pipeline_id.as_deref().unwrap_or("-").dimmed()
        );
        println!("    Mapping:  {}", mapped);
        println!();
    }
    Ok(())
}

async fn check(session: &Session, id: &str) -> Result<()> {
    let resolution = session.mapping().check_mapping(id).await?;

    println!("{} Mapping of {} is complete", "✓".green(), id.cyan());
    for used in &resolution.collections_used {
        println!(
            "    group {} of collection {}",
            used.group_id.dimmed(),
            used.collection_id.dimmed()
        );
    }
    Ok(())
}
