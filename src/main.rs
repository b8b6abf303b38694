//! Relaybot - Entry Point
//!
//! Console driver: reads lines from stdin and routes them through the
//! relay core as if they arrived from a chat. Useful for exercising a
//! deployment without any platform adapter attached.

use anyhow::Result;
use relaybot::{
    ChatKey, Config, FileBackend, ProcessInvoker, Relay, SessionStore, ShortcutStore, TaskQueue,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Relaybot v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Assistant binary: {}", config.assistant_bin);
    info!("Data directory: {}", config.data_dir.display());

    let sessions = SessionStore::open(Arc::new(FileBackend::new(config.session_file()))).await?;
    let shortcuts = ShortcutStore::open(Arc::new(FileBackend::new(config.shortcuts_file()))).await?;
    let queue = Arc::new(TaskQueue::new(
        config.limits.max_queue_size,
        config.limits.max_prompt_len,
    ));
    let invoker = ProcessInvoker::from_config(&config);

    let (relay, mut replies) = Relay::new(
        config,
        sessions.clone(),
        shortcuts,
        queue,
        invoker,
    );

    // Print replies as they arrive; queued work answers out of order
    tokio::spawn(async move {
        while let Some(reply) = replies.recv().await {
            println!("[{}]\n{}\n", reply.chat, reply.text);
        }
    });

    // The console stands in for a single chat
    let chat = ChatKey::telegram("console");
    println!("Type a message, or /help for commands. Ctrl-D exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        relay.handle_message(&chat, &line).await;
    }

    // Drain the debounce window before exiting
    sessions.flush().await?;
    info!("Shutting down");
    Ok(())
}
