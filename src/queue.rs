//! Per-chat task queue
//!
//! Serializes assistant invocations per conversation: each chat has a
//! bounded FIFO of tasks and at most one task in `Processing` at any
//! time. Queues are in-memory only; a process restart drops all pending
//! and in-flight tasks.
//!
//! The queue never runs tasks itself. The integration layer calls
//! [`TaskQueue::dispatch_next`], runs the returned task through the
//! invoker, registers the spawned process's handle for cancellation, and
//! calls [`TaskQueue::complete`] exactly once when the run ends however
//! it ends. Cancellation racing natural completion is safe: whichever
//! side reaches "mark idle" second is a no-op.

use crate::chat::ChatKey;
use rand::{distributions::Alphanumeric, Rng};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Grace window between the termination signal and the forced kill
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Longest task preview shown in status output
const PREVIEW_LEN: usize = 64;

/// A handle the queue can use to stop the process backing the current
/// task. Implementations must make `force_kill` refuse once the process
/// has exited, so a reused pid is never signalled.
pub trait CancelHandle: Send + Sync {
    /// Best-effort graceful termination signal
    fn terminate(&self) -> bool;

    /// Forced kill, refused when the process already exited
    fn force_kill(&self) -> bool;

    fn has_exited(&self) -> bool;
}

/// Task lifecycle state. Completed tasks are removed, not retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
}

/// One queued assistant invocation
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub chat: ChatKey,
    pub prompt: String,
    pub project_dir: Option<String>,
    pub session_id: Option<String>,
    pub added_at: i64,
    pub status: TaskStatus,
    pub started_at: Option<i64>,
}

/// Input for `enqueue`
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub prompt: String,
    pub project_dir: Option<String>,
    pub session_id: Option<String>,
}

/// Why an enqueue was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("queue is full ({0} tasks per chat)")]
    QueueFull(usize),
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("prompt exceeds {0} characters")]
    PromptTooLong(usize),
}

/// Successful enqueue: assigned id and 1-based position, counting any
/// currently processing task
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub task_id: String,
    pub position: usize,
}

/// Outcome of a cancellation attempt
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub success: bool,
    pub message: String,
    pub task_id: Option<String>,
}

/// Read-only snapshot of one chat's queue
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_processing: bool,
    pub current: Option<TaskSummary>,
    pub pending: Vec<TaskSummary>,
}

#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: String,
    pub preview: String,
    pub position: usize,
}

/// Per-chat queue state. The processing task stays at the head of
/// `tasks` until `complete` removes it.
#[derive(Default)]
struct ChatQueue {
    tasks: VecDeque<Task>,
    current_task_id: Option<String>,
    handle: Option<Arc<dyn CancelHandle>>,
}

impl ChatQueue {
    fn is_processing(&self) -> bool {
        self.current_task_id.is_some()
    }
}

/// All chat queues. The outer map is read-locked for lookups; each
/// chat's mutations serialize on that chat's own mutex.
pub struct TaskQueue {
    chats: RwLock<HashMap<ChatKey, Arc<Mutex<ChatQueue>>>>,
    max_queue_size: usize,
    max_prompt_len: usize,
    kill_grace: Duration,
}

impl TaskQueue {
    pub fn new(max_queue_size: usize, max_prompt_len: usize) -> Self {
        Self {
            chats: RwLock::new(HashMap::new()),
            max_queue_size,
            max_prompt_len,
            kill_grace: KILL_GRACE,
        }
    }

    /// Override the forced-kill grace window (tests)
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    async fn chat_queue(&self, chat: &ChatKey) -> Arc<Mutex<ChatQueue>> {
        {
            let chats = self.chats.read().await;
            if let Some(queue) = chats.get(chat) {
                return Arc::clone(queue);
            }
        }
        let mut chats = self.chats.write().await;
        Arc::clone(chats.entry(chat.clone()).or_default())
    }

    /// Append a task. Rejects oversized or empty prompts and full queues
    /// without mutating existing queue contents.
    pub async fn enqueue(
        &self,
        chat: &ChatKey,
        new_task: NewTask,
    ) -> Result<EnqueueReceipt, EnqueueError> {
        if new_task.prompt.trim().is_empty() {
            return Err(EnqueueError::EmptyPrompt);
        }
        if new_task.prompt.chars().count() > self.max_prompt_len {
            return Err(EnqueueError::PromptTooLong(self.max_prompt_len));
        }

        let queue = self.chat_queue(chat).await;
        let mut queue = queue.lock().await;

        if queue.tasks.len() >= self.max_queue_size {
            return Err(EnqueueError::QueueFull(self.max_queue_size));
        }

        let task = Task {
            id: generate_task_id(),
            chat: chat.clone(),
            prompt: new_task.prompt,
            project_dir: new_task.project_dir,
            session_id: new_task.session_id,
            added_at: chrono::Utc::now().timestamp_millis(),
            status: TaskStatus::Pending,
            started_at: None,
        };
        let task_id = task.id.clone();
        queue.tasks.push_back(task);
        let position = queue.tasks.len();

        debug!("Enqueued task {} for {} at position {}", task_id, chat, position);
        Ok(EnqueueReceipt { task_id, position })
    }

    /// Take the head task for execution. Returns `None` when the chat is
    /// already processing or has nothing queued.
    pub async fn dispatch_next(&self, chat: &ChatKey) -> Option<Task> {
        let queue = self.chat_queue(chat).await;
        let mut queue = queue.lock().await;

        if queue.is_processing() {
            return None;
        }

        let task = queue.tasks.front_mut()?;
        task.status = TaskStatus::Processing;
        task.started_at = Some(chrono::Utc::now().timestamp_millis());
        let task = task.clone();
        queue.current_task_id = Some(task.id.clone());

        info!("Dispatching task {} for {}", task.id, chat);
        Some(task)
    }

    /// Attach a cancellable handle to the task currently processing
    pub async fn register_process_handle(&self, chat: &ChatKey, handle: Arc<dyn CancelHandle>) {
        let queue = self.chat_queue(chat).await;
        let mut queue = queue.lock().await;
        if queue.is_processing() {
            queue.handle = Some(handle);
        } else {
            warn!("Process handle registered for {} with no task processing", chat);
        }
    }

    /// Remove a finished (or abandoned) task and return the chat to idle
    /// if it was the one processing. Idempotent: completing a task that
    /// was already removed (e.g. by cancellation) is a no-op.
    pub async fn complete(&self, chat: &ChatKey, task_id: &str) {
        let queue = self.chat_queue(chat).await;
        let mut queue = queue.lock().await;

        let before = queue.tasks.len();
        queue.tasks.retain(|t| t.id != task_id);
        let removed = before != queue.tasks.len();

        if queue.current_task_id.as_deref() == Some(task_id) {
            queue.current_task_id = None;
            queue.handle = None;
            debug!("Task {} completed for {}, queue idle", task_id, chat);
        } else if removed {
            debug!("Pending task {} removed for {}", task_id, chat);
        }
    }

    /// Stop the currently processing task: graceful signal now, forced
    /// kill after the grace window unless the process exits first.
    /// Termination failures are logged, never surfaced as errors.
    pub async fn cancel_current(&self, chat: &ChatKey) -> CancelOutcome {
        let queue = self.chat_queue(chat).await;
        let mut queue = queue.lock().await;

        let task_id = match queue.current_task_id.take() {
            Some(id) => id,
            None => {
                return CancelOutcome {
                    success: false,
                    message: "Nothing is processing right now.".to_string(),
                    task_id: None,
                }
            }
        };

        if let Some(handle) = queue.handle.take() {
            if !handle.terminate() {
                warn!("Termination signal failed for task {} ({})", task_id, chat);
            }
            let grace = self.kill_grace;
            let killed_task = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                // Skipped when the process already exited: the pid may
                // have been reused by an unrelated process by now
                if !handle.has_exited() && handle.force_kill() {
                    warn!("Force-killed task {} after {:?} grace", killed_task, grace);
                }
            });
        }

        queue.tasks.retain(|t| t.id != task_id);
        info!("Cancelled task {} for {}", task_id, chat);

        CancelOutcome {
            success: true,
            message: "Current task cancelled.".to_string(),
            task_id: Some(task_id),
        }
    }

    /// Drop all pending tasks, preserving the one currently processing.
    /// Returns how many were removed.
    pub async fn clear_queue(&self, chat: &ChatKey) -> usize {
        let queue = self.chat_queue(chat).await;
        let mut queue = queue.lock().await;

        let before = queue.tasks.len();
        let current = queue.current_task_id.clone();
        queue.tasks.retain(|t| Some(t.id.as_str()) == current.as_deref());
        let cleared = before - queue.tasks.len();

        if cleared > 0 {
            info!("Cleared {} pending task(s) for {}", cleared, chat);
        }
        cleared
    }

    /// Read-only snapshot of a chat's queue
    pub async fn status(&self, chat: &ChatKey) -> QueueStatus {
        let queue = self.chat_queue(chat).await;
        let queue = queue.lock().await;

        let mut current = None;
        let mut pending = Vec::new();
        for (i, task) in queue.tasks.iter().enumerate() {
            let summary = TaskSummary {
                id: task.id.clone(),
                preview: preview(&task.prompt),
                position: i + 1,
            };
            if task.status == TaskStatus::Processing {
                current = Some(summary);
            } else {
                pending.push(summary);
            }
        }

        QueueStatus {
            queue_length: queue.tasks.len(),
            is_processing: queue.is_processing(),
            current,
            pending,
        }
    }

    /// Human-readable queue summary for chat replies
    pub async fn format_status(&self, chat: &ChatKey) -> String {
        let status = self.status(chat).await;
        if status.queue_length == 0 {
            return "Queue is empty.".to_string();
        }

        let mut out = format!("{} task(s) queued.\n", status.queue_length);
        if let Some(current) = &status.current {
            out.push_str(&format!("* running: {}\n", current.preview));
        }
        for task in &status.pending {
            out.push_str(&format!("{}. {}\n", task.position, task.preview));
        }
        out.trim_end().to_string()
    }
}

fn preview(prompt: &str) -> String {
    let flat = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_LEN {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_LEN).collect();
        format!("{}...", cut)
    }
}

/// Time-based id with a random suffix. Unique enough for one process
/// lifetime; queues do not survive restarts so global uniqueness is not
/// required.
fn generate_task_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}
