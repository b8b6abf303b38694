//! Assistant CLI invoker
//!
//! Runs the external assistant as `<cli> -p --output-format json
//! [--resume <id>]` with the prompt written to the child's stdin. No
//! shell sits between this process and the assistant, so prompt content
//! is never interpreted, whatever metacharacters it contains.
//!
//! Results are discriminated: a timeout and a generic non-zero exit are
//! retryable failures that preserve the caller's stored session handle,
//! while a stale-session exit tells the caller to drop the handle and
//! start fresh on the next attempt.

use crate::queue::CancelHandle;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Default per-invocation deadline
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace window between the termination signal and the forced kill
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Resume handles are hex-and-hyphen strings; anything else never
/// reaches a command line
static SESSION_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F-]{8,64}$").expect("invalid session id pattern"));

/// ANSI escape sequences stripped from non-JSON CLI output
static ANSI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("invalid ansi pattern"));

/// stderr substrings meaning the resume handle is stale, as opposed to
/// a transient failure
const STALE_SESSION_MARKERS: &[&str] = &[
    "no conversation found",
    "session not found",
    "invalid session",
    "unknown session",
];

/// Structured output of the assistant CLI
#[derive(Debug, Deserialize)]
struct CliJsonOutput {
    result: String,
    #[serde(default, alias = "sessionId")]
    session_id: Option<String>,
}

/// How an invocation failed
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error("session id has an unexpected format")]
    InvalidSessionId,
    #[error("failed to start assistant '{bin}': {message}")]
    Spawn { bin: String, message: String },
    #[error("assistant timed out after {0:?}")]
    Timeout(Duration),
    #[error("assistant session is no longer valid")]
    StaleSession,
    #[error("assistant exited with an error")]
    Process {
        exit_code: Option<i32>,
        detail: String,
    },
    #[error("i/o failure talking to the assistant: {0}")]
    Io(String),
}

impl InvokeError {
    /// True when the caller should drop its stored session handle.
    /// Everything else preserves it: timeouts and transient process
    /// failures must not lose conversation continuity.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::StaleSession)
    }
}

/// Successful invocation result
#[derive(Debug, Clone)]
pub struct InvokeOutput {
    pub text: String,
    /// Present when the CLI produced structured output; `None` for the
    /// raw-text fallback
    pub session_id: Option<String>,
}

/// Options for one invocation
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Working directory the assistant runs in
    pub cwd: PathBuf,
    /// Resume handle from a previous invocation
    pub session_id: Option<String>,
    /// Deadline override; the invoker default applies when `None`
    pub timeout: Option<Duration>,
}

impl InvokeOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            session_id: None,
            timeout: None,
        }
    }
}

/// Cancellable view of a spawned assistant process. Signals go to the
/// recorded pid; once `exited` is set the pid is never signalled again,
/// because the OS may have reused it.
#[derive(Debug, Clone)]
pub struct ProcessGuard {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

impl ProcessGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    #[cfg(unix)]
    fn signal(&self, sig: i32) -> bool {
        match self.pid {
            Some(pid) if !self.has_exited() => unsafe {
                libc::kill(pid as libc::pid_t, sig) == 0
            },
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _sig: i32) -> bool {
        warn!("Process signalling is not supported on this platform");
        false
    }
}

#[cfg(unix)]
use libc::{SIGKILL, SIGTERM};
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

impl CancelHandle for ProcessGuard {
    fn terminate(&self) -> bool {
        self.signal(SIGTERM)
    }

    fn force_kill(&self) -> bool {
        self.signal(SIGKILL)
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// A spawned assistant call that has not finished yet
#[derive(Debug)]
pub struct RunningInvocation {
    child: Child,
    guard: ProcessGuard,
    timeout: Duration,
    started: std::time::Instant,
}

impl RunningInvocation {
    /// Handle for queue registration / cancellation
    pub fn guard(&self) -> ProcessGuard {
        self.guard.clone()
    }

    /// Wait for the assistant to finish and interpret its output
    pub async fn wait(self) -> Result<InvokeOutput, InvokeError> {
        let RunningInvocation {
            mut child,
            guard,
            timeout,
            started,
        } = self;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let (out, err) = tokio::join!(read_stream(stdout), read_stream(stderr));
            let status = child.wait().await;
            (status, out, err)
        };

        match tokio::time::timeout(timeout, run).await {
            Ok((Ok(status), out, err)) => {
                guard.mark_exited();
                let elapsed = started.elapsed();

                if status.success() {
                    info!("Assistant completed in {:?}", elapsed);
                    Ok(parse_output(&out))
                } else if is_stale_session(&err) {
                    info!("Assistant reported a stale session after {:?}", elapsed);
                    Err(InvokeError::StaleSession)
                } else {
                    warn!(
                        "Assistant exited with {:?} after {:?}: {}",
                        status.code(),
                        elapsed,
                        err.trim()
                    );
                    Err(InvokeError::Process {
                        exit_code: status.code(),
                        detail: err.trim().to_string(),
                    })
                }
            }
            Ok((Err(e), _, _)) => {
                guard.mark_exited();
                Err(InvokeError::Io(e.to_string()))
            }
            Err(_) => {
                // Deadline passed: ask nicely, then hand the child to a
                // reaper that force-kills after the grace window unless
                // it exits first
                warn!("Assistant timed out after {:?}, terminating", timeout);
                let _ = guard.terminate();
                let reaper_guard = guard.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(_) => reaper_guard.mark_exited(),
                        Err(_) => {
                            warn!("Assistant ignored termination, force-killing");
                            let _ = child.kill().await;
                            reaper_guard.mark_exited();
                        }
                    }
                });
                Err(InvokeError::Timeout(timeout))
            }
        }
    }
}

/// Spawns and supervises assistant CLI invocations
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    bin: String,
    default_timeout: Duration,
}

impl ProcessInvoker {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            bin: config.assistant_bin.clone(),
            default_timeout: config.invoke_timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Start an invocation without waiting for it, so the caller can
    /// register the process guard before blocking on the result
    pub async fn spawn(
        &self,
        prompt: &str,
        opts: InvokeOptions,
    ) -> Result<RunningInvocation, InvokeError> {
        if let Some(sid) = &opts.session_id {
            if !SESSION_ID_PATTERN.is_match(sid) {
                warn!("Rejecting malformed session id ({} chars)", sid.len());
                return Err(InvokeError::InvalidSessionId);
            }
        }

        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p").arg("--output-format").arg("json");
        if let Some(sid) = &opts.session_id {
            cmd.arg("--resume").arg(sid);
        }
        cmd.current_dir(&opts.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            "Spawning {} in {} (resume: {})",
            self.bin,
            opts.cwd.display(),
            opts.session_id.is_some()
        );

        let mut child = cmd.spawn().map_err(|e| InvokeError::Spawn {
            bin: self.bin.clone(),
            message: e.to_string(),
        })?;

        let guard = ProcessGuard::new(child.id());

        // Deliver the prompt over the pipe and close it so the child
        // sees EOF
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                let _ = child.start_kill();
                let reaper_guard = guard.clone();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                    reaper_guard.mark_exited();
                });
                return Err(InvokeError::Io(e.to_string()));
            }
        }

        Ok(RunningInvocation {
            child,
            guard,
            timeout: opts.timeout.unwrap_or(self.default_timeout),
            started: std::time::Instant::now(),
        })
    }

    /// Spawn and wait in one call
    pub async fn invoke(
        &self,
        prompt: &str,
        opts: InvokeOptions,
    ) -> Result<InvokeOutput, InvokeError> {
        self.spawn(prompt, opts).await?.wait().await
    }
}

async fn read_stream<R: tokio::io::AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Interpret successful stdout: structured JSON when the CLI produced
/// it, otherwise the raw text as a session-less response
fn parse_output(stdout: &str) -> InvokeOutput {
    match serde_json::from_str::<CliJsonOutput>(stdout.trim()) {
        Ok(json) => InvokeOutput {
            text: json.result,
            session_id: json.session_id,
        },
        Err(_) => InvokeOutput {
            text: ANSI_PATTERN.replace_all(stdout, "").trim().to_string(),
            session_id: None,
        },
    }
}

fn is_stale_session(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    STALE_SESSION_MARKERS.iter().any(|m| lower.contains(m))
}
