//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod collection;
mod consortium;
mod images;
mod run;

pub use collection::CollectionCommands;
pub use consortium::ConsortiumCommands;
pub use images::ImageCommands;
pub use run::RunCommands;

use anyhow::{Context, Result};
use clap::Subcommand;
use consort_runner::Session;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run management
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Consortium mappings
    Consortium {
        #[command(subcommand)]
        command: ConsortiumCommands,
    },
    /// Local collections
    Collection {
        #[command(subcommand)]
        command: CollectionCommands,
    },
    /// Computation images
    Images {
        #[command(subcommand)]
        command: ImageCommands,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, session: &Session) -> Result<()> {
    match command {
        Commands::Run { command } => run::handle_run_command(command, session).await,
        Commands::Consortium { command } => {
            consortium::handle_consortium_command(command, session).await
        }
        Commands::Collection { command } => {
            collection::handle_collection_command(command, session).await
        }
        Commands::Images { command } => images::handle_image_command(command, session).await,
    }
}

/// Reads a JSON document from disk
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}
