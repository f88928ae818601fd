//! Collection command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use consort_core::domain::collection::Collection;
use consort_runner::Session;
use consort_runner::repository::CollectionRepository;
use std::path::PathBuf;

use super::read_json;

/// Collection subcommands
#[derive(Subcommand)]
pub enum CollectionCommands {
    /// List local collections
    List,
    /// Store a collection described by a JSON file
    Add { collection: PathBuf },
    /// Delete a collection and every mapping pointing into it
    Delete { id: String },
}

pub async fn handle_collection_command(
    command: CollectionCommands,
    session: &Session,
) -> Result<()> {
    match command {
        CollectionCommands::List => list(session).await,
        CollectionCommands::Add { collection } => {
            let collection: Collection = read_json(&collection).await?;
            CollectionRepository::put(session.store().as_ref(), &collection).await?;
            println!("{} Stored collection {}", "✓".green(), collection.name.cyan());
            Ok(())
        }
        CollectionCommands::Delete { id } => {
            session.mapping().delete_collection(&id).await?;
            println!("{} Deleted collection {}", "✓".green(), id.cyan());
            Ok(())
        }
    }
}

async fn list(session: &Session) -> Result<()> {
    let collections = CollectionRepository::list(session.store().as_ref()).await?;

    if collections.is_empty() {
        println!("{}", "No collections found.".yellow());
        return Ok(());
    }

    for collection in collections {
        println!(
            "  {} {} ({})",
            "▸".cyan(),
            collection.name,
            collection.id.dimmed()
        );
        for group in collection.file_groups.values() {
            println!(
                "    {} {} file(s){}",
                group.name,
                group.files.len(),
                if group.meta_file.is_some() { ", meta file" } else { "" }
            );
        }
        if !collection.associated_consortia.is_empty() {
            println!(
                "    Used by: {}",
                collection.associated_consortia.join(", ").dimmed()
            );
        }
        println!();
    }
    Ok(())
}
