//! Host-wide critical-section lock.
//!
//! The tailscale CLI races when invoked concurrently, so every call
//! sequence whose intermediate state must not be observed by another
//! worker or another wirelift process runs under an exclusive advisory
//! lock on a well-known file. The guard releases on drop, covering
//! error and early-exit paths.

use std::fs::{self, File};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nix::fcntl::{Flock, FlockArg};

pub const LOCK_FILE: &str = "control/locker";

/// Exclusive host-wide lock, held until dropped.
pub struct FileLock {
    _lock: Flock<File>,
}

/// Acquire the lock, blocking until it is free. Acquisition happens on
/// a blocking thread so waiting never stalls the async workers.
pub async fn lock(runtime_dir: &Path) -> Result<FileLock> {
    let path = runtime_dir.join(LOCK_FILE);
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {parent:?}"))?;
        }
        let file = File::create(&path)
            .with_context(|| format!("failed to open lock file {path:?}"))?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| anyhow!("failed to lock {path:?}: {errno}"))?;
        Ok(FileLock { _lock: lock })
    })
    .await
    .context("lock acquisition task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let first = lock(dir.path()).await.unwrap();
        drop(first);
        // Would deadlock if the first acquisition leaked.
        let _second = lock(dir.path()).await.unwrap();
        assert!(dir.path().join(LOCK_FILE).exists());
    }
}
