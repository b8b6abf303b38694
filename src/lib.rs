//! Relaybot core
//!
//! Library behind chat→assistant relay bots: messages arriving from a
//! messaging platform are queued per chat, run through a local AI
//! assistant CLI, and the output is returned to the chat. Platform
//! adapters (Telegram polling, Feishu WebSocket) live outside this
//! crate and drive it in-process.
//!
//! # Architecture
//!
//! ```text
//! Chat Adapter ──► Relay ──► TaskQueue ──► ProcessInvoker ──► assistant CLI
//!                    │           │
//!                    ├── SessionStore   (chat → project dir + session id)
//!                    ├── ShortcutStore  (chat → command templates)
//!                    └── replies channel back to the adapter
//! ```
//!
//! Within one chat, tasks run strictly one at a time in FIFO order;
//! independent chats progress concurrently. Queues are in-memory only,
//! so a restart drops pending work. Session and shortcut state is
//! durable (JSON files keyed by `"platform:chatId"`).

pub mod chat;
pub mod config;
pub mod invoker;
pub mod queue;
pub mod relay;
pub mod session;
pub mod shortcuts;
pub mod storage;

pub use chat::{ChatKey, Platform};
pub use config::{Config, Limits};
pub use invoker::{InvokeError, InvokeOptions, InvokeOutput, ProcessGuard, ProcessInvoker};
pub use queue::{
    CancelHandle, CancelOutcome, EnqueueError, EnqueueReceipt, NewTask, QueueStatus, Task,
    TaskQueue, TaskStatus, TaskSummary,
};
pub use relay::{OutboundReply, Relay};
pub use session::{SessionRecord, SessionStore};
pub use shortcuts::{ShortcutError, ShortcutRecord, ShortcutStore};
pub use storage::{FileBackend, MemoryBackend, StateBackend};
