//! Inter-process advisory locks
//!
//! One lock file per artifact class under the cache root. The lock is
//! cooperative: every mutating path in this tool (and any concurrent
//! invocation of it) goes through `acquire`/`release`; nothing at the
//! kernel level enforces it. An abandoned lock older than the timeout is
//! treated as evidence of a dead holder and reclaimed — a very small risk
//! of a double run is preferred over a permanent deadlock.

use crate::cache::CacheClass;
use crate::events::{self, Event};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fixed wait-poll interval between lock checks
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// File-based exclusive claim per artifact class
#[derive(Debug, Clone)]
pub struct StageLock {
    dir: PathBuf,
    poll_interval: Duration,
}

impl StageLock {
    /// Lock manager over the given lock directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the poll interval (tests)
    pub fn with_poll_interval(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
        }
    }

    fn lock_path(&self, class: CacheClass) -> PathBuf {
        self.dir.join(format!("{}.lock", class.name()))
    }

    /// Try to acquire the lock for `class`, waiting up to `timeout`.
    ///
    /// While another holder's file exists this polls at a fixed interval,
    /// emitting a wait event each round. Two distinct timeout checks apply:
    /// the *lock's age* beyond `timeout` reclaims it; the *waiter's own
    /// elapsed time* beyond `timeout` gives up. Returns false on give-up or
    /// any unexpected filesystem failure — the caller reports a lock
    /// timeout, never a crash.
    pub async fn acquire(&self, class: CacheClass, timeout: Duration) -> bool {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("cannot create lock directory {}: {}", self.dir.display(), e);
            return false;
        }

        let path = self.lock_path(class);
        let start = Instant::now();

        loop {
            match try_claim(&path) {
                Claim::Acquired => {
                    debug!("acquired lock for {}", class);
                    return true;
                }
                Claim::Held => {}
                Claim::Failed => return false,
            }

            let held_for = match lock_age(&path) {
                Some(age) => age,
                // Holder released between the claim attempt and the stat;
                // try to claim again right away.
                None => continue,
            };

            events::emit(&Event::wait_lock(class.name(), held_for.as_secs()));

            if held_for > timeout {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        events::emit(&Event::lock_reclaimed(class.name(), held_for.as_secs()));
                        continue;
                    }
                    Err(e) => {
                        warn!("failed to reclaim stale lock {}: {}", path.display(), e);
                    }
                }
            }

            if start.elapsed() > timeout {
                return false;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Release the lock for `class`.
    ///
    /// Best-effort: a lock we fail to delete merely delays, never corrupts,
    /// the next run.
    pub fn release(&self, class: CacheClass) {
        let path = self.lock_path(class);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to release lock {}: {}", path.display(), e);
            }
        }
    }

    /// Whether a lock file currently exists for `class`
    pub fn is_held(&self, class: CacheClass) -> bool {
        self.lock_path(class).exists()
    }
}

enum Claim {
    Acquired,
    Held,
    Failed,
}

/// Claim the lock with an exclusive create; losing the race means held.
fn try_claim(path: &Path) -> Claim {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            let owner = json!({
                "owner_pid": std::process::id(),
                "created_at": chrono::Utc::now().to_rfc3339(),
            });
            if let Err(e) = file.write_all(owner.to_string().as_bytes()) {
                warn!("failed to write lock owner to {}: {}", path.display(), e);
            }
            Claim::Acquired
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Claim::Held,
        Err(e) => {
            warn!("failed to create lock {}: {}", path.display(), e);
            Claim::Failed
        }
    }
}

/// Age of the lock file from its mtime, None if it vanished
fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.elapsed().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FAST_POLL: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn acquire_free_lock() {
        let temp = TempDir::new().unwrap();
        let lock = StageLock::with_poll_interval(temp.path(), FAST_POLL);

        assert!(lock.acquire(CacheClass::DeepGemm, Duration::from_secs(1)).await);
        assert!(lock.is_held(CacheClass::DeepGemm));

        let content = std::fs::read_to_string(temp.path().join("deep_gemm.lock")).unwrap();
        let owner: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(owner["owner_pid"], std::process::id());
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let lock = StageLock::with_poll_interval(temp.path(), FAST_POLL);

        // A fresh lock held by "someone else": young enough that the age
        // check never reclaims it within this test's timeout.
        assert!(lock.acquire(CacheClass::MoeTune, Duration::from_secs(600)).await);

        let waiter = StageLock::with_poll_interval(temp.path(), FAST_POLL);
        let acquired = waiter
            .acquire(CacheClass::MoeTune, Duration::from_millis(120))
            .await;
        assert!(!acquired);
        // Original holder's file is untouched
        assert!(lock.is_held(CacheClass::MoeTune));
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let lock = StageLock::with_poll_interval(temp.path(), FAST_POLL);
        assert!(lock.acquire(CacheClass::Flashinfer, Duration::from_secs(600)).await);

        // Let the lock age past the (short) timeout the waiter uses.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let waiter = StageLock::with_poll_interval(temp.path(), FAST_POLL);
        let acquired = waiter
            .acquire(CacheClass::Flashinfer, Duration::from_millis(100))
            .await;
        assert!(acquired, "stale lock should be reclaimed, not failed");
        assert!(waiter.is_held(CacheClass::Flashinfer));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let lock = StageLock::with_poll_interval(temp.path(), FAST_POLL);

        assert!(lock.acquire(CacheClass::Inductor, Duration::from_secs(1)).await);
        lock.release(CacheClass::Inductor);
        assert!(!lock.is_held(CacheClass::Inductor));

        // Releasing an absent lock must not panic or error
        lock.release(CacheClass::Inductor);
    }

    #[tokio::test]
    async fn reacquire_after_release() {
        let temp = TempDir::new().unwrap();
        let lock = StageLock::with_poll_interval(temp.path(), FAST_POLL);

        assert!(lock.acquire(CacheClass::DeepGemm, Duration::from_secs(1)).await);
        lock.release(CacheClass::DeepGemm);
        assert!(lock.acquire(CacheClass::DeepGemm, Duration::from_secs(1)).await);
    }
}
