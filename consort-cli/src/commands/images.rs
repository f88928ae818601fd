//! Image command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use consort_core::dto::event::ImageProgress;
use consort_runner::Session;
use consort_runner::service::ProgressSink;
use std::sync::Arc;

use crate::output::print_progress;

/// Image subcommands
#[derive(Subcommand)]
pub enum ImageCommands {
    /// List local images
    List,
    /// Pull images ahead of a run
    Pull {
        #[arg(required = true)]
        images: Vec<String>,
    },
    /// Remove a local image
    Remove { id: String },
    /// Check that the container runtime answers
    Status,
}

pub async fn handle_image_command(command: ImageCommands, session: &Session) -> Result<()> {
    let controller = session.controller();

    match command {
        ImageCommands::List => {
            let images = controller.list_images().await?;
            if images.is_empty() {
                println!("{}", "No images found.".yellow());
            }
            for image in images {
                let short_id: String = image.id.chars().take(12).collect();
                println!(
                    "  {} {} {}",
                    short_id.dimmed(),
                    image.names.join(", ").cyan(),
                    format_size(image.size).dimmed()
                );
            }
            Ok(())
        }
        ImageCommands::Pull { images } => {
            let sink: ProgressSink =
                Arc::new(|progress: ImageProgress| print_progress("", &progress));
            controller.pull_images(&images, sink).await?;
            println!("{} All images available", "✓".green());
            Ok(())
        }
        ImageCommands::Status => {
            let version = controller.runtime_status().await?;
            println!("{} {}", "✓".green(), version);
            Ok(())
        }
        ImageCommands::Remove { id } => {
            controller.remove_image(&id).await?;
            println!("{} Removed image {}", "✓".green(), id.dimmed());
            Ok(())
        }
    }
}

fn format_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    format!("{:.1} MB", bytes as f64 / MB)
}
