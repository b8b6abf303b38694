//! Relay end-to-end flow against a scripted assistant

#![cfg(unix)]

use relaybot::{
    ChatKey, Config, MemoryBackend, ProcessInvoker, Relay, SessionStore, ShortcutStore,
    StateBackend, TaskQueue,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("assistant.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

async fn scripted_relay(
    script_body: &str,
) -> (Relay, mpsc::Receiver<relaybot::OutboundReply>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), script_body);

    let sessions = SessionStore::open_with_debounce(
        Arc::new(MemoryBackend::new()) as Arc<dyn StateBackend>,
        Duration::from_millis(10),
    )
    .await
    .unwrap();
    let shortcuts = ShortcutStore::open(Arc::new(MemoryBackend::new()) as Arc<dyn StateBackend>)
        .await
        .unwrap();
    let queue = Arc::new(TaskQueue::new(10, 10_000));
    let invoker = ProcessInvoker::new(script.to_str().unwrap());

    let (relay, rx) = Relay::new(Config::default(), sessions, shortcuts, queue, invoker);
    (relay, rx, dir)
}

async fn next_reply(rx: &mut mpsc::Receiver<relaybot::OutboundReply>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("reply in time")
        .expect("channel open")
        .text
}

#[tokio::test]
async fn test_prompt_round_trip_updates_session() {
    let (relay, mut rx, dir) = scripted_relay(
        r#"cat > /dev/null
printf '{"result": "assistant says hi", "session_id": "feedc0de-9999"}'"#,
    )
    .await;
    let chat = ChatKey::telegram("e2e");

    relay
        .handle_message(&chat, &format!("/project {}", dir.path().display()))
        .await;
    assert!(next_reply(&mut rx).await.contains("Project directory set"));

    relay.handle_message(&chat, "hello there").await;
    assert_eq!(next_reply(&mut rx).await, "assistant says hi");

    // The structured response's session handle was stored for resuming
    let status = relay.sessions().status_string(&chat).await;
    assert!(status.contains("feedc0de"), "status was: {}", status);
}

#[tokio::test]
async fn test_three_prompts_answered_in_order() {
    let (relay, mut rx, dir) = scripted_relay(
        r#"prompt=$(cat)
printf '{"result": "echo %s", "session_id": "feedc0de-0003"}' "$prompt""#,
    )
    .await;
    let chat = ChatKey::telegram("fifo");

    relay
        .handle_message(&chat, &format!("/project {}", dir.path().display()))
        .await;
    next_reply(&mut rx).await;

    relay.handle_message(&chat, "first").await;
    relay.handle_message(&chat, "second").await;
    relay.handle_message(&chat, "third").await;

    // Skip "Queued at position N" notices; collect the three answers
    let mut answers = Vec::new();
    while answers.len() < 3 {
        let reply = next_reply(&mut rx).await;
        if reply.starts_with("echo ") {
            answers.push(reply);
        }
    }
    assert_eq!(answers, vec!["echo first", "echo second", "echo third"]);
}

#[tokio::test]
async fn test_stale_session_resets_stored_handle() {
    let (relay, mut rx, dir) = scripted_relay(
        r#"cat > /dev/null
echo "Error: session not found" >&2
exit 1"#,
    )
    .await;
    let chat = ChatKey::telegram("stale");

    relay
        .handle_message(&chat, &format!("/project {}", dir.path().display()))
        .await;
    next_reply(&mut rx).await;

    // Plant a stored handle that the scripted assistant will reject
    relay
        .sessions()
        .update_session_id(&chat, "feedc0de-0004", None)
        .await;

    relay.handle_message(&chat, "resume please").await;
    assert!(next_reply(&mut rx).await.contains("expired"));

    let record = relay.sessions().get(&chat).await.unwrap();
    assert_eq!(record.session_id, None, "stale handle dropped");
    assert!(record.project_dir.is_some(), "project dir preserved");
}
