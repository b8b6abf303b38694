//! Process invoker integration tests
//!
//! The assistant binary is configurable, so these tests point it at
//! small shell scripts instead of a real installation.

#![cfg(unix)]

use relaybot::queue::CancelHandle;
use relaybot::{InvokeError, InvokeOptions, ProcessInvoker};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn opts(dir: &Path) -> InvokeOptions {
    InvokeOptions::in_dir(dir)
}

#[tokio::test]
async fn test_json_output_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "assistant.sh",
        r#"cat > /dev/null
printf '{"result": "all done", "session_id": "feedc0de-0001"}'"#,
    );

    let invoker = ProcessInvoker::new(script.to_str().unwrap());
    let output = invoker.invoke("do the thing", opts(dir.path())).await.unwrap();

    assert_eq!(output.text, "all done");
    assert_eq!(output.session_id.as_deref(), Some("feedc0de-0001"));
}

#[tokio::test]
async fn test_non_json_output_falls_back_to_raw_text() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "assistant.sh",
        r#"cat > /dev/null
echo "plain text answer""#,
    );

    let invoker = ProcessInvoker::new(script.to_str().unwrap());
    let output = invoker.invoke("hi", opts(dir.path())).await.unwrap();

    assert_eq!(output.text, "plain text answer");
    assert_eq!(output.session_id, None, "raw output carries no session");
}

#[tokio::test]
async fn test_prompt_with_shell_metacharacters_is_inert() {
    let dir = tempfile::tempdir().unwrap();
    // Echo stdin back: if any shell interpreted the prompt, the marker
    // file would exist afterwards
    let script = write_script(
        dir.path(),
        "assistant.sh",
        r#"prompt=$(cat)
printf '{"result": "got: %s", "session_id": "feedc0de-0002"}' "$prompt""#,
    );

    let invoker = ProcessInvoker::new(script.to_str().unwrap());
    let marker = dir.path().join("pwned");
    let prompt = format!("\"; touch {} #", marker.display());
    let output = invoker.invoke(&prompt, opts(dir.path())).await.unwrap();

    assert!(output.text.contains("touch"), "prompt arrived verbatim");
    assert!(!marker.exists(), "prompt was never executed");
}

#[tokio::test]
async fn test_timeout_terminates_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "assistant.sh", "exec sleep 30");

    let invoker = ProcessInvoker::new(script.to_str().unwrap());
    let mut options = opts(dir.path());
    options.timeout = Some(Duration::from_millis(200));

    let started = std::time::Instant::now();
    let err = invoker.invoke("hang", options).await.unwrap_err();

    assert!(matches!(err, InvokeError::Timeout(_)));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "timeout resolved promptly, not after the sleep"
    );
    assert!(!err.invalidates_session(), "timeout keeps the session handle");
}

#[tokio::test]
async fn test_stale_session_detected_from_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "assistant.sh",
        r#"cat > /dev/null
echo "Error: No conversation found with session ID deadbeef" >&2
exit 1"#,
    );

    let invoker = ProcessInvoker::new(script.to_str().unwrap());
    let err = invoker.invoke("resume me", opts(dir.path())).await.unwrap_err();

    assert!(matches!(err, InvokeError::StaleSession));
    assert!(err.invalidates_session());
}

#[tokio::test]
async fn test_generic_failure_preserves_session() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "assistant.sh",
        r#"cat > /dev/null
echo "rate limit exceeded" >&2
exit 2"#,
    );

    let invoker = ProcessInvoker::new(script.to_str().unwrap());
    let err = invoker.invoke("try", opts(dir.path())).await.unwrap_err();

    match &err {
        InvokeError::Process { exit_code, detail } => {
            assert_eq!(*exit_code, Some(2));
            assert!(detail.contains("rate limit"));
        }
        other => panic!("expected Process error, got {:?}", other),
    }
    assert!(!err.invalidates_session());
}

#[tokio::test]
async fn test_missing_binary_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = ProcessInvoker::new("/no/such/assistant-bin");
    let err = invoker.invoke("hello", opts(dir.path())).await.unwrap_err();
    assert!(matches!(err, InvokeError::Spawn { .. }));
}

#[tokio::test]
async fn test_guard_terminate_stops_a_running_call() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "assistant.sh", "exec sleep 30");

    let invoker = ProcessInvoker::new(script.to_str().unwrap());
    let running = invoker.spawn("hang", opts(dir.path())).await.unwrap();
    let guard = running.guard();
    assert!(!guard.has_exited());

    let waiter = tokio::spawn(running.wait());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(guard.terminate());

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("terminated call resolves promptly")
        .unwrap();
    assert!(result.is_err(), "a signalled process reports failure");
    assert!(guard.has_exited());
}
