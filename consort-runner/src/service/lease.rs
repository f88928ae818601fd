//! Run leases
//!
//! A lease gives one driver exclusive ownership of a (consortium, run) pair.
//! Within the process a set of held keys is consulted first; across processes
//! a lock file under `leases/` is created with create-new semantics. Lock
//! files older than the TTL are treated as abandoned and replaced.

use chrono::Utc;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::error::RunError;

#[derive(Debug, Clone)]
pub struct RunLeases {
    dir: PathBuf,
    ttl: Duration,
    held: Arc<Mutex<HashSet<String>>>,
}

/// A held lease; dropping it releases the lease
#[derive(Debug)]
pub struct RunLease {
    key: String,
    path: PathBuf,
    held: Arc<Mutex<HashSet<String>>>,
}

impl RunLeases {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Takes the lease for a run, or fails with `LeaseHeld`
    pub fn acquire(&self, consortium_id: &str, run_id: &str) -> Result<RunLease, RunError> {
        let key = format!("{}__{}", consortium_id, run_id);
        let held_err = || RunError::LeaseHeld {
            consortium_id: consortium_id.to_string(),
            run_id: run_id.to_string(),
        };

        {
            let mut held = self
                .held
                .lock()
                .map_err(|_| RunError::Store("lease registry poisoned".to_string()))?;
            if !held.insert(key.clone()) {
                return Err(held_err());
            }
        }

        let path = self.dir.join(format!("{}.lock", key));
        let lease = RunLease {
            key,
            path,
            held: Arc::clone(&self.held),
        };

        // From here on dropping `lease` undoes the in-process claim
        std::fs::create_dir_all(&self.dir).map_err(RunError::store)?;

        match create_lock(&lease.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !self.is_stale(&lease.path) {
                    forget(&lease);
                    return Err(held_err());
                }
                warn!("Replacing abandoned lease {}", lease.path.display());
                std::fs::remove_file(&lease.path).map_err(RunError::store)?;
                create_lock(&lease.path).map_err(|e| {
                    forget(&lease);
                    if e.kind() == ErrorKind::AlreadyExists {
                        held_err()
                    } else {
                        RunError::store(e)
                    }
                })?;
            }
            Err(e) => {
                forget(&lease);
                return Err(RunError::store(e));
            }
        }

        debug!("Acquired lease {}", lease.key);
        Ok(lease)
    }

    fn is_stale(&self, path: &std::path::Path) -> bool {
        let modified = std::fs::metadata(path).and_then(|m| m.modified());
        match modified {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age > self.ttl)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Marks a lease that never got its lock file so drop leaves the file alone
fn forget(lease: &RunLease) {
    if let Ok(mut held) = lease.held.lock() {
        held.remove(&lease.key);
    }
}

fn create_lock(path: &std::path::Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(
        file,
        "{{\"pid\":{},\"acquiredAt\":\"{}\"}}",
        std::process::id(),
        Utc::now().to_rfc3339()
    )
}

impl RunLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let owned = match self.held.lock() {
            Ok(mut held) => held.remove(&self.key),
            Err(_) => false,
        };
        if !owned {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lease {}", self.key),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release lease {}: {}", self.key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let leases = RunLeases::new(dir.path(), Duration::from_secs(60));

        let lease = leases.acquire("cons-1", "run-1").unwrap();
        assert!(dir.path().join("cons-1__run-1.lock").exists());
        assert!(matches!(
            leases.acquire("cons-1", "run-1"),
            Err(RunError::LeaseHeld { .. })
        ));

        // other runs are independent
        let other = leases.acquire("cons-1", "run-2").unwrap();
        drop(other);

        drop(lease);
        assert!(!dir.path().join("cons-1__run-1.lock").exists());
        assert!(leases.acquire("cons-1", "run-1").is_ok());
    }

    #[test]
    fn test_lock_file_from_other_process_blocks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cons-1__run-1.lock"), "{}").unwrap();
        let leases = RunLeases::new(dir.path(), Duration::from_secs(60));

        assert!(matches!(
            leases.acquire("cons-1", "run-1"),
            Err(RunError::LeaseHeld { .. })
        ));
        // the foreign lock survives the failed attempt
        assert!(dir.path().join("cons-1__run-1.lock").exists());
    }

    #[test]
    fn test_unusable_lease_dir_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("leases");
        std::fs::write(&blocker, "not a directory").unwrap();
        let leases = RunLeases::new(&blocker, Duration::from_secs(60));

        assert!(matches!(
            leases.acquire("cons-1", "run-1"),
            Err(RunError::Store(_))
        ));
        // the failed attempt does not leave the key claimed
        assert!(leases.held.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cons-1__run-1.lock"), "{}").unwrap();
        let leases = RunLeases::new(dir.path(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));

        let lease = leases.acquire("cons-1", "run-1").unwrap();
        assert_eq!(lease.key(), "cons-1__run-1");
    }
}
