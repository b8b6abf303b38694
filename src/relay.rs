//! Relay orchestration
//!
//! The platform-independent layer chat adapters call with each inbound
//! text message. It owns the control flow the adapters share: resolve
//! the chat's session, recognize built-in commands, expand shortcuts,
//! enqueue, and drive dispatch → invoke → complete for the chat's queue.
//!
//! Replies are delivered through an outbound channel rather than a
//! return value: queued work finishes long after the triggering message
//! was handled, and the adapter routes each reply to its platform by
//! chat key.

use crate::chat::ChatKey;
use crate::config::Config;
use crate::invoker::{InvokeError, InvokeOptions, ProcessInvoker};
use crate::queue::{NewTask, Task, TaskQueue};
use crate::session::SessionStore;
use crate::shortcuts::{ShortcutStore, COMMAND_PREFIX};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Outbound reply for the adapter to deliver
#[derive(Debug, Clone)]
pub struct OutboundReply {
    pub chat: ChatKey,
    pub text: String,
}

const HELP_TEXT: &str = "\
Send any text to run it through the assistant in your project directory.

Commands:
  /project <path>  set the working directory for this chat
  /new             start a fresh assistant conversation
  /status          session and queue overview
  /queue           queued tasks
  /stop            cancel the task currently running
  /clear           drop all pending tasks
  /shortcut add <name> <command>   define a shortcut
  /shortcut del <name>             remove a shortcut
  /shortcut list                   list shortcuts
  /help            this message";

/// Shared state behind every adapter. Cheap to clone; clones share
/// the same stores and queue.
#[derive(Clone)]
pub struct Relay {
    config: Config,
    sessions: SessionStore,
    shortcuts: Arc<ShortcutStore>,
    queue: Arc<TaskQueue>,
    invoker: ProcessInvoker,
    replies: mpsc::Sender<OutboundReply>,
}

impl Relay {
    /// Build the relay; the returned receiver yields replies for the
    /// adapter to deliver
    pub fn new(
        config: Config,
        sessions: SessionStore,
        shortcuts: Arc<ShortcutStore>,
        queue: Arc<TaskQueue>,
        invoker: ProcessInvoker,
    ) -> (Self, mpsc::Receiver<OutboundReply>) {
        let (replies, rx) = mpsc::channel(64);
        (
            Self {
                config,
                sessions,
                shortcuts,
                queue,
                invoker,
                replies,
            },
            rx,
        )
    }

    /// The session store backing this relay
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Handle one inbound text message from a chat
    pub async fn handle_message(&self, chat: &ChatKey, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        if let Some(rest) = text.strip_prefix(COMMAND_PREFIX) {
            let mut tokens = rest.splitn(2, char::is_whitespace);
            let command = tokens.next().unwrap_or_default().to_lowercase();
            let args = tokens.next().unwrap_or("").trim();

            match command.as_str() {
                "start" | "help" => self.reply(chat, HELP_TEXT.to_string()).await,
                "new" => self.cmd_new(chat).await,
                "project" => self.cmd_project(chat, args).await,
                "status" | "session" => self.cmd_status(chat).await,
                "stop" | "cancel" => {
                    let outcome = self.queue.cancel_current(chat).await;
                    self.reply(chat, outcome.message).await;
                }
                "clear" => {
                    let cleared = self.queue.clear_queue(chat).await;
                    self.reply(chat, format!("Removed {} pending task(s).", cleared)).await;
                }
                "queue" => {
                    let status = self.queue.format_status(chat).await;
                    self.reply(chat, status).await;
                }
                "shortcut" | "shortcuts" => self.cmd_shortcut(chat, args).await,
                _ => {
                    // Not built in: try the user's shortcuts, otherwise
                    // it's an unknown command
                    match self.shortcuts.expand(chat, text).await {
                        Some(expanded) => self.submit_prompt(chat, &expanded).await,
                        None => {
                            self.reply(
                                chat,
                                format!("Unknown command /{}. Try /help.", command),
                            )
                            .await
                        }
                    }
                }
            }
            return;
        }

        self.submit_prompt(chat, text).await;
    }

    async fn cmd_new(&self, chat: &ChatKey) {
        self.sessions.clear(chat).await;
        self.reply(
            chat,
            "Started a new conversation. The next message begins a fresh session.".to_string(),
        )
        .await;
    }

    async fn cmd_project(&self, chat: &ChatKey, args: &str) {
        if args.is_empty() {
            self.reply(chat, "Usage: /project <path>".to_string()).await;
            return;
        }

        let expanded = shellexpand::tilde(args).into_owned();
        let path = Path::new(&expanded);
        if !path.is_absolute() {
            self.reply(
                chat,
                format!("'{}' is not an absolute path.", args),
            )
            .await;
            return;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                self.sessions.set_project_dir(chat, &expanded).await;
                self.reply(chat, format!("Project directory set to {}.", expanded)).await;
            }
            _ => {
                self.reply(
                    chat,
                    format!("'{}' is not a directory I can access.", expanded),
                )
                .await;
            }
        }
    }

    async fn cmd_status(&self, chat: &ChatKey) {
        let session = self.sessions.status_string(chat).await;
        let queue = self.queue.format_status(chat).await;
        self.reply(chat, format!("{}\n\n{}", session, queue)).await;
    }

    async fn cmd_shortcut(&self, chat: &ChatKey, args: &str) {
        let mut tokens = args.splitn(2, char::is_whitespace);
        let action = tokens.next().unwrap_or_default().to_lowercase();
        let rest = tokens.next().unwrap_or("").trim();

        match action.as_str() {
            "add" => {
                let mut parts = rest.splitn(2, char::is_whitespace);
                let name = parts.next().unwrap_or_default();
                let command = parts.next().unwrap_or("").trim();
                match self.shortcuts.set_shortcut(chat, name, command).await {
                    Ok(outcome) => {
                        let verb = if outcome.is_update { "updated" } else { "added" };
                        self.reply(chat, format!("Shortcut /{} {}.", outcome.name, verb)).await;
                    }
                    // Validation errors are specific so the user can fix
                    // their input
                    Err(e) => self.reply(chat, e.to_string()).await,
                }
            }
            "del" | "delete" | "remove" => {
                match self.shortcuts.delete_shortcut(chat, rest).await {
                    Ok(()) => self.reply(chat, format!("Shortcut removed: {}", rest)).await,
                    Err(e) => self.reply(chat, e.to_string()).await,
                }
            }
            "list" | "" => {
                let listing = self.shortcuts.format_list(chat).await;
                self.reply(chat, listing).await;
            }
            _ => {
                self.reply(
                    chat,
                    "Usage: /shortcut add <name> <command> | del <name> | list".to_string(),
                )
                .await;
            }
        }
    }

    /// Queue a prompt for the chat and make sure its queue is draining
    async fn submit_prompt(&self, chat: &ChatKey, prompt: &str) {
        let record = self.sessions.get(chat).await.unwrap_or_default();
        let Some(project_dir) = record.project_dir else {
            self.reply(
                chat,
                "No working directory set. Use /project <path> first.".to_string(),
            )
            .await;
            return;
        };

        let new_task = NewTask {
            prompt: prompt.to_string(),
            project_dir: Some(project_dir),
            session_id: record.session_id,
        };

        match self.queue.enqueue(chat, new_task).await {
            Ok(receipt) => {
                if receipt.position > 1 {
                    self.reply(chat, format!("Queued at position {}.", receipt.position)).await;
                }
                self.spawn_drive(chat.clone());
            }
            // Queue-full and prompt-validation refusals are specific by
            // design; they carry no process detail
            Err(e) => self.reply(chat, e.to_string()).await,
        }
    }

    /// Drain the chat's queue in the background. Safe to call at any
    /// time: extra drivers see an already-processing queue and exit.
    fn spawn_drive(&self, chat: ChatKey) {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(task) = relay.queue.dispatch_next(&chat).await {
                let task_id = task.id.clone();
                if let Some(reply) = relay.run_task(task).await {
                    relay.reply(&chat, reply).await;
                }
                relay.queue.complete(&chat, &task_id).await;
            }
        });
    }

    /// Run one dispatched task through the invoker. Returns the reply
    /// text, or `None` when the task was cancelled out from under us
    /// and the user already heard about it.
    async fn run_task(&self, task: Task) -> Option<String> {
        let chat = task.chat.clone();
        let cwd = task.project_dir.clone().unwrap_or_else(|| ".".to_string());
        let opts = InvokeOptions {
            cwd: cwd.clone().into(),
            session_id: task.session_id.clone(),
            timeout: Some(self.config.invoke_timeout),
        };

        let running = match self.invoker.spawn(&task.prompt, opts).await {
            Ok(running) => running,
            Err(InvokeError::InvalidSessionId) => {
                // Stored handle is garbage; drop it so the next attempt
                // starts clean
                self.sessions.clear(&chat).await;
                return Some(
                    "Stored session was unusable and has been reset. Please try again."
                        .to_string(),
                );
            }
            Err(e) => {
                error!("Spawn failed for {}: {}", chat, e);
                return Some("The assistant could not be started.".to_string());
            }
        };

        self.queue
            .register_process_handle(&chat, Arc::new(running.guard()))
            .await;

        match running.wait().await {
            Ok(output) => {
                if let Some(sid) = &output.session_id {
                    self.sessions.update_session_id(&chat, sid, Some(&cwd)).await;
                }
                info!("Task {} finished for {}", task.id, chat);
                if output.text.is_empty() {
                    Some("(the assistant returned no text)".to_string())
                } else {
                    Some(output.text)
                }
            }
            Err(e) if e.invalidates_session() => {
                self.sessions.clear(&chat).await;
                Some(
                    "The remembered conversation has expired; the next message starts a \
                     fresh one."
                        .to_string(),
                )
            }
            Err(e) => {
                // Detail stays in the log; users get a generic failure
                error!("Task {} failed for {}: {}", task.id, chat, e);
                if self.was_cancelled(&chat, &task.id).await {
                    debug!("Suppressing failure reply for cancelled task {}", task.id);
                    return None;
                }
                match e {
                    InvokeError::Timeout(t) => Some(format!(
                        "The assistant took longer than {}s and was stopped. Try again \
                         or simplify the request.",
                        t.as_secs()
                    )),
                    _ => Some("The assistant run failed. See the server log for details.".to_string()),
                }
            }
        }
    }

    /// A task that is no longer current was cancelled (or completed)
    /// behind our back
    async fn was_cancelled(&self, chat: &ChatKey, task_id: &str) -> bool {
        let status = self.queue.status(chat).await;
        status.current.map(|c| c.id) != Some(task_id.to_string())
    }

    async fn reply(&self, chat: &ChatKey, text: String) {
        if self
            .replies
            .send(OutboundReply {
                chat: chat.clone(),
                text,
            })
            .await
            .is_err()
        {
            error!("Reply channel closed, dropping reply for {}", chat);
        }
    }
}
