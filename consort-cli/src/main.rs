//! Consort CLI
//!
//! Command-line front-end of the consortium run controller. Every invocation
//! logs the user in, runs one command and logs out again, which shuts the
//! execution engine down.

mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use consort_runner::{ChannelObserver, Config, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "consort")]
#[command(about = "Consortium pipeline run controller", long_about = None)]
struct Cli {
    /// Id of the local user
    #[arg(long, env = "CONSORT_USER_ID")]
    user: String,

    /// Application directory holding stores, staging and outputs
    #[arg(long, env = "CONSORT_APP_DIR", default_value = ".consort")]
    app_dir: PathBuf,

    /// API server URL
    #[arg(long, env = "CONSORT_API_URL", default_value = "http://localhost:3100")]
    api_url: String,

    /// Upper bound of the random delay before a run starts, in milliseconds
    #[arg(long, env = "CONSORT_START_JITTER_MS", default_value_t = 3000)]
    start_jitter_ms: u64,

    /// Iterations a local step may take
    #[arg(long, env = "CONSORT_MAX_ITERATIONS", default_value_t = 100)]
    max_iterations: u64,

    /// Container CLI binary
    #[arg(long, env = "CONSORT_CONTAINER_BIN", default_value = "podman")]
    container_bin: String,

    /// Seconds after which an abandoned run lease is replaced
    #[arg(long, env = "CONSORT_LEASE_TTL", default_value_t = 21600)]
    lease_ttl: u64,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::new(self.user.clone(), self.app_dir.clone());
        config.api_url = self.api_url.clone();
        config.max_start_jitter = Duration::from_millis(self.start_jitter_ms);
        config.max_iterations = self.max_iterations;
        config.container_bin = self.container_bin.clone();
        config.lease_ttl = Duration::from_secs(self.lease_ttl);
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consort_runner=info,consort=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    std::panic::set_hook(Box::new(|info| {
        error!("Panic: {}", info);
    }));

    let cli = Cli::parse();
    let config = cli.config();
    config.validate()?;
    debug!(
        "Loaded configuration: user={}, app_dir={}, api_url={}",
        config.user_id,
        config.app_dir.display(),
        config.api_url
    );

    let (observer, events) = ChannelObserver::channel();
    let printer = tokio::spawn(output::print_events(events));

    let manager = SessionManager::new(config);
    let session = manager.login(&cli.user, Arc::new(observer)).await?;

    let result = handle_command(cli.command, &session).await;

    manager.logout().await;
    // Last observer handle; the printer drains and ends once it is gone
    drop(session);
    if let Err(e) = printer.await {
        error!("Event printer failed: {}", e);
    }

    result
}
