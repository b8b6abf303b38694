//! Durable state backends
//!
//! The session and shortcut stores persist as a single JSON document
//! each. This module defines the backend they write through: a file
//! implementation guarded by a cooperative lock file for production, and
//! an in-memory fake for tests.
//!
//! The lock is advisory only. It guards against multiple OS processes
//! sharing one store file, not against threads inside one process (the
//! stores serialize their own writers).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// A lock file untouched for this long is considered abandoned and seized
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

/// Longest a writer waits for the lock before forcing acquisition
const LOCK_WAIT_MAX: Duration = Duration::from_secs(5);

/// Delay between lock acquisition attempts
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Whole-document storage for a store's JSON state
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the persisted document, `None` if nothing was ever stored
    async fn load(&self) -> Result<Option<String>>;

    /// Replace the persisted document
    async fn store(&self, contents: &str) -> Result<()>;
}

/// File-backed state with a cooperative lock file
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquire the lock file, seizing stale locks and forcing
    /// acquisition once the wait limit passes
    async fn acquire_lock(&self) -> Result<()> {
        let lock_path = self.lock_path();
        let deadline = tokio::time::Instant::now() + LOCK_WAIT_MAX;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&lock_path).await {
                        warn!("Seizing stale lock: {}", lock_path.display());
                        let _ = tokio::fs::remove_file(&lock_path).await;
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        warn!(
                            "Lock wait exceeded {:?}, forcing acquisition: {}",
                            LOCK_WAIT_MAX,
                            lock_path.display()
                        );
                        let _ = tokio::fs::remove_file(&lock_path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create lock file {}", lock_path.display())
                    })
                }
            }
        }
    }

    async fn lock_is_stale(&self, lock_path: &Path) -> bool {
        match tokio::fs::metadata(lock_path).await {
            Ok(meta) => meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .map(|age| age > LOCK_STALE_AFTER)
                .unwrap_or(false),
            // Vanished between the create attempt and this check
            Err(_) => true,
        }
    }

    async fn release_lock(&self) {
        let lock_path = self.lock_path();
        if let Err(e) = tokio::fs::remove_file(&lock_path).await {
            warn!("Failed to remove lock file {}: {}", lock_path.display(), e);
        }
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    async fn store(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        self.acquire_lock().await?;

        // Write to a sibling temp file, then rename over the target so a
        // crash mid-write never leaves a torn document
        let result = async {
            let mut tmp = self.path.as_os_str().to_os_string();
            tmp.push(".tmp");
            let tmp = PathBuf::from(tmp);

            tokio::fs::write(&tmp, contents)
                .await
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            tokio::fs::rename(&tmp, &self.path)
                .await
                .with_context(|| format!("failed to replace {}", self.path.display()))?;
            Ok(())
        }
        .await;

        self.release_lock().await;

        if result.is_ok() {
            debug!("Persisted {} bytes to {}", contents.len(), self.path.display());
        }
        result
    }
}

/// In-memory backend for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryBackend {
    contents: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store` calls observed
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.contents.lock().unwrap().clone())
    }

    async fn store(&self, contents: &str) -> Result<()> {
        *self.contents.lock().unwrap() = Some(contents.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
