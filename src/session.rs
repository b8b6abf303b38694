//! Session store
//!
//! Durable mapping from a chat to its working project directory and the
//! assistant's opaque session handle. Mutations schedule a debounced
//! flush of the whole map (a burst of updates lands as one write); a
//! crash inside the debounce window loses at most that window's
//! mutations, which is accepted for this metadata. Call
//! [`SessionStore::flush`] on graceful shutdown to drain the pending
//! window.
//!
//! Records are never evicted; the map grows with the number of chats
//! ever seen. Acceptable for single-operator deployments.

use crate::chat::ChatKey;
use crate::storage::StateBackend;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Batch window for the debounced flush
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(2);

/// Per-chat session state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Absolute project directory the assistant runs in
    pub project_dir: Option<String>,

    /// Opaque resume handle into the assistant's own session store.
    /// Only meaningful together with `project_dir`.
    pub session_id: Option<String>,

    /// Unix millis of the last mutation
    pub updated_at: i64,
}

/// Durable chat→session mapping with debounced persistence.
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StateBackend>,
    records: Arc<RwLock<HashMap<String, SessionRecord>>>,
    flush_scheduled: Arc<AtomicBool>,
    debounce: Duration,
}

impl SessionStore {
    /// Open the store, loading any previously persisted state
    pub async fn open(backend: Arc<dyn StateBackend>) -> Result<Self> {
        Self::open_with_debounce(backend, FLUSH_DEBOUNCE).await
    }

    /// Open with a custom debounce window (tests)
    pub async fn open_with_debounce(
        backend: Arc<dyn StateBackend>,
        debounce: Duration,
    ) -> Result<Self> {
        let records: HashMap<String, SessionRecord> = match backend.load().await? {
            Some(contents) => serde_json::from_str(&contents)?,
            None => HashMap::new(),
        };

        debug!("Session store opened with {} records", records.len());

        Ok(Self {
            backend,
            records: Arc::new(RwLock::new(records)),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
            debounce,
        })
    }

    /// Get the session record for a chat
    pub async fn get(&self, chat: &ChatKey) -> Option<SessionRecord> {
        let records = self.records.read().await;
        records.get(&chat.storage_key()).cloned()
    }

    /// Set or replace the project directory, preserving other fields
    pub async fn set_project_dir(&self, chat: &ChatKey, path: &str) {
        {
            let mut records = self.records.write().await;
            let record = records.entry(chat.storage_key()).or_default();
            record.project_dir = Some(path.to_string());
            record.updated_at = chrono::Utc::now().timestamp_millis();
        }
        debug!("Project dir for {} set to {}", chat, path);
        self.schedule_flush();
    }

    /// Record the assistant's session handle after a successful call.
    /// The project directory is overwritten only when one is supplied.
    pub async fn update_session_id(
        &self,
        chat: &ChatKey,
        session_id: &str,
        project_dir: Option<&str>,
    ) {
        {
            let mut records = self.records.write().await;
            let record = records.entry(chat.storage_key()).or_default();
            record.session_id = Some(session_id.to_string());
            if let Some(dir) = project_dir {
                record.project_dir = Some(dir.to_string());
            }
            record.updated_at = chrono::Utc::now().timestamp_millis();
        }
        self.schedule_flush();
    }

    /// Drop the session handle, keeping the project directory
    pub async fn clear(&self, chat: &ChatKey) {
        {
            let mut records = self.records.write().await;
            let record = records.entry(chat.storage_key()).or_default();
            record.session_id = None;
            record.updated_at = chrono::Utc::now().timestamp_millis();
        }
        debug!("Session cleared for {}", chat);
        self.schedule_flush();
    }

    /// Human-readable summary for status replies
    pub async fn status_string(&self, chat: &ChatKey) -> String {
        match self.get(chat).await {
            None => "No session yet. Send a message to start one, or set a working \
                     directory with /project <path>."
                .to_string(),
            Some(record) => {
                let project = record.project_dir.as_deref().unwrap_or("(not set)");
                let session = match &record.session_id {
                    Some(id) => format!("resuming {}", short_id(id)),
                    None => "fresh (no conversation to resume)".to_string(),
                };
                format!("Project: {}\nSession: {}", project, session)
            }
        }
    }

    /// Write the current map out now, draining any pending debounce window
    pub async fn flush(&self) -> Result<()> {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let snapshot = {
            let records = self.records.read().await;
            serde_json::to_string_pretty(&*records)?
        };
        self.backend.store(&snapshot).await
    }

    /// Arm the debounce timer; at most one flush task is in flight
    fn schedule_flush(&self) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(store.debounce).await;
            if let Err(e) = store.flush().await {
                warn!("Session store flush failed: {}", e);
            }
        });
    }
}

/// First segment of an opaque id, enough to recognize it in logs
fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    async fn memory_store(debounce_ms: u64) -> (SessionStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = SessionStore::open_with_debounce(
            backend.clone() as Arc<dyn StateBackend>,
            Duration::from_millis(debounce_ms),
        )
        .await
        .unwrap();
        (store, backend)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (store, _) = memory_store(10).await;
        let chat = ChatKey::telegram("100");

        store.set_project_dir(&chat, "/a").await;
        store.update_session_id(&chat, "sid1", None).await;

        let record = store.get(&chat).await.unwrap();
        assert_eq!(record.project_dir.as_deref(), Some("/a"));
        assert_eq!(record.session_id.as_deref(), Some("sid1"));

        store.clear(&chat).await;
        let record = store.get(&chat).await.unwrap();
        assert_eq!(record.project_dir.as_deref(), Some("/a"));
        assert_eq!(record.session_id, None);
    }

    #[tokio::test]
    async fn test_update_session_id_can_set_project() {
        let (store, _) = memory_store(10).await;
        let chat = ChatKey::feishu("oc_1");

        store.update_session_id(&chat, "sid2", Some("/b")).await;
        let record = store.get(&chat).await.unwrap();
        assert_eq!(record.project_dir.as_deref(), Some("/b"));
        assert_eq!(record.session_id.as_deref(), Some("sid2"));

        // Omitting the dir keeps the prior value
        store.update_session_id(&chat, "sid3", None).await;
        let record = store.get(&chat).await.unwrap();
        assert_eq!(record.project_dir.as_deref(), Some("/b"));
        assert_eq!(record.session_id.as_deref(), Some("sid3"));
    }

    #[tokio::test]
    async fn test_burst_of_updates_flushes_once() {
        let (store, backend) = memory_store(50).await;
        let chat = ChatKey::telegram("7");

        store.set_project_dir(&chat, "/a").await;
        store.update_session_id(&chat, "s1", None).await;
        store.update_session_id(&chat, "s2", None).await;
        assert_eq!(backend.write_count(), 0, "nothing flushed inside the window");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.write_count(), 1, "burst collapsed into one flush");
    }

    #[tokio::test]
    async fn test_explicit_flush_drains_window() {
        let (store, backend) = memory_store(60_000).await;
        let chat = ChatKey::telegram("8");

        store.set_project_dir(&chat, "/w").await;
        store.flush().await.unwrap();
        assert_eq!(backend.write_count(), 1);

        let persisted = backend.load().await.unwrap().unwrap();
        assert!(persisted.contains("telegram:8"));
        assert!(persisted.contains("/w"));
    }

    #[tokio::test]
    async fn test_reopen_restores_records() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = SessionStore::open_with_debounce(
                backend.clone() as Arc<dyn StateBackend>,
                Duration::from_millis(10),
            )
            .await
            .unwrap();
            let chat = ChatKey::telegram("42");
            store.update_session_id(&chat, "persisted-sid", Some("/p")).await;
            store.flush().await.unwrap();
        }

        let store = SessionStore::open(backend as Arc<dyn StateBackend>)
            .await
            .unwrap();
        let record = store.get(&ChatKey::telegram("42")).await.unwrap();
        assert_eq!(record.session_id.as_deref(), Some("persisted-sid"));
        assert_eq!(record.project_dir.as_deref(), Some("/p"));
    }

    #[tokio::test]
    async fn test_status_string() {
        let (store, _) = memory_store(10).await;
        let chat = ChatKey::telegram("9");

        assert!(store.status_string(&chat).await.contains("No session"));

        store.set_project_dir(&chat, "/proj").await;
        let status = store.status_string(&chat).await;
        assert!(status.contains("/proj"));
        assert!(status.contains("fresh"));

        store.update_session_id(&chat, "abcd1234-5678", None).await;
        let status = store.status_string(&chat).await;
        assert!(status.contains("abcd1234"));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let (store, _) = memory_store(10).await;
        let chat = ChatKey::telegram("77");

        let clone = store.clone();
        clone.set_project_dir(&chat, "/shared").await;

        let record = store.get(&chat).await.unwrap();
        assert_eq!(record.project_dir.as_deref(), Some("/shared"));
    }
}
