//! Chat identity
//!
//! A conversation is identified by `(platform, chat id)` across every
//! store in the crate. The string form `"platform:chatId"` is the key
//! used in the durable JSON files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Messaging platform a conversation lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Feishu,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Feishu => "feishu",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telegram" => Ok(Self::Telegram),
            "feishu" => Ok(Self::Feishu),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Composite conversation identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatKey {
    pub platform: Platform,
    pub chat_id: String,
}

impl ChatKey {
    pub fn new(platform: Platform, chat_id: impl Into<String>) -> Self {
        Self {
            platform,
            chat_id: chat_id.into(),
        }
    }

    pub fn telegram(chat_id: impl Into<String>) -> Self {
        Self::new(Platform::Telegram, chat_id)
    }

    pub fn feishu(chat_id: impl Into<String>) -> Self {
        Self::new(Platform::Feishu, chat_id)
    }

    /// Key used in the durable store files
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.platform.as_str(), self.chat_id)
    }
}

impl fmt::Display for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform.as_str(), self.chat_id)
    }
}

impl FromStr for ChatKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (platform, chat_id) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed chat key: {}", s))?;
        if chat_id.is_empty() {
            return Err(format!("malformed chat key: {}", s));
        }
        Ok(Self {
            platform: platform.parse()?,
            chat_id: chat_id.to_string(),
        })
    }
}
