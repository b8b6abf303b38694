//! Configuration management

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Ceiling on per-task execution time enforced at the queue layer
pub const MAX_INVOKE_TIMEOUT: Duration = Duration::from_secs(600);

/// Limits consumed by the core components
#[derive(Debug, Clone)]
pub struct Limits {
    /// Pending + processing tasks allowed per chat
    pub max_queue_size: usize,

    /// Longest prompt accepted for enqueue, in characters
    pub max_prompt_len: usize,

    /// Shortcuts allowed per chat
    pub max_shortcuts: usize,

    /// Longest shortcut name, in characters
    pub max_shortcut_name_len: usize,

    /// Longest shortcut command template, in characters
    pub max_shortcut_command_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            max_prompt_len: 10_000,
            max_shortcuts: 20,
            max_shortcut_name_len: 20,
            max_shortcut_command_len: 1_000,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Assistant CLI binary to invoke
    pub assistant_bin: String,

    /// Directory holding the session and shortcut store files
    pub data_dir: PathBuf,

    /// Per-invocation timeout
    pub invoke_timeout: Duration,

    /// Core limits
    pub limits: Limits,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let assistant_bin =
            std::env::var("RELAY_ASSISTANT_BIN").unwrap_or_else(|_| "claude".to_string());

        let data_dir = std::env::var("RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("relaybot")
            });

        let invoke_timeout_secs: u64 = std::env::var("RELAY_INVOKE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        let invoke_timeout = Duration::from_secs(invoke_timeout_secs).min(MAX_INVOKE_TIMEOUT);

        Ok(Self {
            assistant_bin,
            data_dir,
            invoke_timeout,
            limits: Limits::default(),
        })
    }

    /// Path of the durable session store file
    pub fn session_file(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    /// Path of the durable shortcut store file
    pub fn shortcuts_file(&self) -> PathBuf {
        self.data_dir.join("shortcuts.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assistant_bin: "claude".to_string(),
            data_dir: PathBuf::from("."),
            invoke_timeout: Duration::from_secs(300),
            limits: Limits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_queue_size, 10);
        assert_eq!(limits.max_prompt_len, 10_000);
        assert_eq!(limits.max_shortcuts, 20);
    }

    #[test]
    fn test_store_paths() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/relay"),
            ..Default::default()
        };
        assert_eq!(config.session_file(), PathBuf::from("/tmp/relay/sessions.json"));
        assert_eq!(config.shortcuts_file(), PathBuf::from("/tmp/relay/shortcuts.json"));
    }
}
