//! Runner configuration
//!
//! Defines the on-disk application directory, the API server connection and
//! the tuning knobs for run start, local execution and leases.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Id of the logged-in user; partitions output, staging and mirror trees
    pub user_id: String,

    /// Root of everything the controller writes to disk
    pub app_dir: PathBuf,

    /// API server base URL (e.g., "http://localhost:3100")
    pub api_url: String,

    /// Upper bound of the random delay applied before a run starts
    pub max_start_jitter: Duration,

    /// Iterations a local step may take before it is failed
    pub max_iterations: u64,

    /// Container CLI binary
    pub container_bin: String,

    /// Age after which a run lease left on disk is considered abandoned
    pub lease_ttl: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(user_id: String, app_dir: PathBuf) -> Self {
        Self {
            user_id,
            app_dir,
            api_url: "http://localhost:3100".to_string(),
            max_start_jitter: Duration::from_millis(3000),
            max_iterations: 100,
            container_bin: "podman".to_string(),
            lease_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - CONSORT_USER_ID (required)
    /// - CONSORT_APP_DIR (optional, default: ./.consort)
    /// - CONSORT_API_URL (optional, default: http://localhost:3100)
    /// - CONSORT_START_JITTER_MS (optional, milliseconds, default: 3000)
    /// - CONSORT_MAX_ITERATIONS (optional, default: 100)
    /// - CONSORT_CONTAINER_BIN (optional, default: podman)
    /// - CONSORT_LEASE_TTL (optional, seconds, default: 21600)
    pub fn from_env() -> anyhow::Result<Self> {
        let user_id = std::env::var("CONSORT_USER_ID")
            .map_err(|_| anyhow::anyhow!("CONSORT_USER_ID environment variable not set"))?;

        let app_dir = std::env::var("CONSORT_APP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".consort"));

        let mut config = Self::new(user_id, app_dir);

        if let Ok(api_url) = std::env::var("CONSORT_API_URL") {
            config.api_url = api_url;
        }

        if let Some(jitter) = std::env::var("CONSORT_START_JITTER_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.max_start_jitter = Duration::from_millis(jitter);
        }

        if let Some(max_iterations) = std::env::var("CONSORT_MAX_ITERATIONS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.max_iterations = max_iterations;
        }

        if let Ok(bin) = std::env::var("CONSORT_CONTAINER_BIN") {
            config.container_bin = bin;
        }

        if let Some(ttl) = std::env::var("CONSORT_LEASE_TTL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.lease_ttl = Duration::from_secs(ttl);
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.user_id.is_empty() {
            anyhow::bail!("user_id cannot be empty");
        }

        if self.user_id.contains(['/', '\\']) || self.user_id == ".." {
            anyhow::bail!("user_id cannot contain path separators");
        }

        if self.app_dir.as_os_str().is_empty() {
            anyhow::bail!("app_dir cannot be empty");
        }

        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            anyhow::bail!("api_url must start with http:// or https://");
        }

        if self.max_iterations == 0 {
            anyhow::bail!("max_iterations must be greater than 0");
        }

        if self.container_bin.is_empty() {
            anyhow::bail!("container_bin cannot be empty");
        }

        if self.lease_ttl.is_zero() {
            anyhow::bail!("lease_ttl must be greater than 0");
        }

        Ok(())
    }

    /// `output/`: canonical run outputs, partitioned by user then run
    pub fn output_root(&self) -> PathBuf {
        self.app_dir.join("output")
    }

    /// `staging/<userId>/`
    pub fn staging_dir(&self) -> PathBuf {
        self.app_dir.join("staging").join(&self.user_id)
    }

    /// `runs/<userId>/`: human-browsable mirror of outputs
    pub fn runs_dir(&self) -> PathBuf {
        self.app_dir.join("runs").join(&self.user_id)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.app_dir.join("store")
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.app_dir.join("leases")
    }

    /// Scratch space of the local engine
    pub fn engine_dir(&self) -> PathBuf {
        self.app_dir.join("engine")
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("local".to_string(), PathBuf::from(".consort"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_start_jitter, Duration::from_millis(3000));
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.container_bin, "podman");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.user_id = String::new();
        assert!(config.validate().is_err());

        config.user_id = "../escape".to_string();
        assert!(config.validate().is_err());

        config.user_id = "user-1".to_string();
        config.api_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config.api_url = "https://api.example.org".to_string();
        assert!(config.validate().is_ok());

        config.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layout_partitioned_by_user() {
        let config = Config::new("user-1".to_string(), PathBuf::from("/srv/app"));
        assert_eq!(config.staging_dir(), PathBuf::from("/srv/app/staging/user-1"));
        assert_eq!(config.runs_dir(), PathBuf::from("/srv/app/runs/user-1"));
        assert_eq!(config.output_root(), PathBuf::from("/srv/app/output"));
    }
}
