//! Shortcut store
//!
//! User-defined command templates, per chat. A shortcut is a lowercase
//! name mapped to a command string with optional `$1..$N` positional
//! placeholders. Expansion turns `/build test` into the stored template
//! with `$1` replaced by `test`; placeholders with no matching argument
//! are stripped.
//!
//! Unlike the session store, mutations here are rare, so persistence is
//! a synchronous write-through on every change.

use crate::chat::ChatKey;
use crate::storage::StateBackend;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Leading character marking a command / shortcut invocation
pub const COMMAND_PREFIX: char = '/';

/// Valid shortcut name: lowercase alphanumeric + underscore, 1-20 chars
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]{1,20}$").expect("invalid name pattern"));

/// `$N` positional placeholder
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(\d+)").expect("invalid placeholder pattern"));

/// Command templates that are refused outright. Matching is best-effort
/// string screening, not a sandbox; it catches the obvious foot-guns.
static DENYLIST: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)rm\s+(-[a-z]*[rf][a-z]*\s+)+",  // recursive/forced delete
        r"(?i)\bmkfs",                        // filesystem format
        r"(?i)\bdd\s+if=",                    // raw disk writes
        r"(?i)>\s*/dev/(sd|nvme|hd)",         // clobber block devices
        r":\(\)\s*\{.*\};\s*:",               // fork bomb
        r"(?i)\b(curl|wget)\b[^|]*\|\s*(ba|z|da)?sh", // pipe-to-shell download
        r"(?i)chmod\s+(-[a-z]+\s+)*777\s+/",  // world-writable root
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid denylist pattern"))
    .collect()
});

/// Built-in command names a shortcut may not shadow
const RESERVED_NAMES: &[&str] = &[
    "start", "help", "new", "project", "session", "status", "stop", "cancel",
    "clear", "queue", "shortcut", "shortcuts",
];

/// A stored command template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortcutRecord {
    pub command: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Why a shortcut definition was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShortcutError {
    #[error("shortcut names are 1-20 lowercase letters, digits or underscores")]
    InvalidName,
    #[error("'{0}' is a built-in command and cannot be redefined")]
    ReservedName(String),
    #[error("shortcut command must not be empty")]
    EmptyCommand,
    #[error("shortcut command exceeds {0} characters")]
    CommandTooLong(usize),
    #[error("shortcut command matches a blocked destructive pattern")]
    DangerousCommand,
    #[error("shortcut limit reached ({0} per chat)")]
    TooMany(usize),
    #[error("no shortcut named '{0}'")]
    NotFound(String),
}

/// Outcome of a successful `set_shortcut`
#[derive(Debug, Clone)]
pub struct SetOutcome {
    pub name: String,
    pub is_update: bool,
}

type ShortcutMap = HashMap<String, HashMap<String, ShortcutRecord>>;

/// Durable per-chat shortcut templates
pub struct ShortcutStore {
    backend: Arc<dyn StateBackend>,
    shortcuts: RwLock<ShortcutMap>,
    max_per_chat: usize,
    max_command_len: usize,
}

impl ShortcutStore {
    /// Open the store, loading any previously persisted state
    pub async fn open(backend: Arc<dyn StateBackend>) -> Result<Arc<Self>> {
        Self::open_with_limits(backend, 20, 1_000).await
    }

    pub async fn open_with_limits(
        backend: Arc<dyn StateBackend>,
        max_per_chat: usize,
        max_command_len: usize,
    ) -> Result<Arc<Self>> {
        let shortcuts: ShortcutMap = match backend.load().await? {
            Some(contents) => serde_json::from_str(&contents)?,
            None => HashMap::new(),
        };

        debug!("Shortcut store opened for {} chats", shortcuts.len());

        Ok(Arc::new(Self {
            backend,
            shortcuts: RwLock::new(shortcuts),
            max_per_chat,
            max_command_len,
        }))
    }

    /// Define or update a shortcut. The per-chat cap only applies to new
    /// names; updating an existing shortcut always succeeds.
    pub async fn set_shortcut(
        &self,
        chat: &ChatKey,
        name: &str,
        command: &str,
    ) -> Result<SetOutcome, ShortcutError> {
        let name = name.trim().to_lowercase();
        if !NAME_PATTERN.is_match(&name) {
            return Err(ShortcutError::InvalidName);
        }
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(ShortcutError::ReservedName(name));
        }

        let command = command.trim();
        if command.is_empty() {
            return Err(ShortcutError::EmptyCommand);
        }
        if command.chars().count() > self.max_command_len {
            return Err(ShortcutError::CommandTooLong(self.max_command_len));
        }
        if DENYLIST.iter().any(|p| p.is_match(command)) {
            return Err(ShortcutError::DangerousCommand);
        }

        let mut shortcuts = self.shortcuts.write().await;
        let chat_shortcuts = shortcuts.entry(chat.storage_key()).or_default();

        let is_update = chat_shortcuts.contains_key(&name);
        if !is_update && chat_shortcuts.len() >= self.max_per_chat {
            return Err(ShortcutError::TooMany(self.max_per_chat));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let record = chat_shortcuts
            .entry(name.clone())
            .or_insert_with(|| ShortcutRecord {
                command: String::new(),
                created_at: now,
                updated_at: now,
            });
        record.command = command.to_string();
        record.updated_at = now;

        self.persist(&shortcuts).await;
        info!(
            "Shortcut '{}' {} for {}",
            name,
            if is_update { "updated" } else { "added" },
            chat
        );
        Ok(SetOutcome { name, is_update })
    }

    /// Remove a shortcut by (case-insensitive) name
    pub async fn delete_shortcut(
        &self,
        chat: &ChatKey,
        name: &str,
    ) -> Result<(), ShortcutError> {
        let name = name.trim().to_lowercase();
        let mut shortcuts = self.shortcuts.write().await;
        let removed = shortcuts
            .get_mut(&chat.storage_key())
            .and_then(|m| m.remove(&name))
            .is_some();

        if !removed {
            return Err(ShortcutError::NotFound(name));
        }

        self.persist(&shortcuts).await;
        info!("Shortcut '{}' deleted for {}", name, chat);
        Ok(())
    }

    /// Try to expand `text` as a shortcut invocation. Returns `None` when
    /// the message is not a shortcut (no prefix, or no such name), in
    /// which case the caller falls through to default command handling.
    pub async fn expand(&self, chat: &ChatKey, text: &str) -> Option<String> {
        let text = text.trim();
        let rest = text.strip_prefix(COMMAND_PREFIX)?;

        let mut tokens = rest.split_whitespace();
        let name = tokens.next()?.to_lowercase();
        let args: Vec<&str> = tokens.collect();

        let shortcuts = self.shortcuts.read().await;
        let record = shortcuts.get(&chat.storage_key())?.get(&name)?;

        let expanded = PLACEHOLDER.replace_all(&record.command, |caps: &regex::Captures| {
            caps[1]
                .parse::<usize>()
                .ok()
                .filter(|&n| n >= 1)
                .and_then(|n| args.get(n - 1).copied())
                .unwrap_or("")
                .to_string()
        });

        Some(expanded.trim().to_string())
    }

    /// All shortcuts for a chat, sorted by name
    pub async fn list(&self, chat: &ChatKey) -> Vec<(String, ShortcutRecord)> {
        let shortcuts = self.shortcuts.read().await;
        let mut entries: Vec<(String, ShortcutRecord)> = shortcuts
            .get(&chat.storage_key())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Human-readable listing for chat replies
    pub async fn format_list(&self, chat: &ChatKey) -> String {
        let entries = self.list(chat).await;
        if entries.is_empty() {
            return "No shortcuts defined. Add one with /shortcut add <name> <command>."
                .to_string();
        }

        let mut out = format!("{} shortcut(s):\n", entries.len());
        for (name, record) in entries {
            let preview = truncate_chars(&record.command, 60);
            out.push_str(&format!("  /{} -> {}\n", name, preview));
        }
        out.trim_end().to_string()
    }

    /// Write-through persist; failures are logged, the in-memory state
    /// stays authoritative for the running process
    async fn persist(&self, shortcuts: &ShortcutMap) {
        match serde_json::to_string_pretty(shortcuts) {
            Ok(contents) => {
                if let Err(e) = self.backend.store(&contents).await {
                    tracing::warn!("Shortcut store persist failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("Shortcut store serialize failed: {}", e),
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
