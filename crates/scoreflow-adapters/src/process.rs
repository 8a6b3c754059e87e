// Child-process runner.
//
// The sole place that touches the environment's PATH. Vendor tools (git,
// terraform, kubectl, ansible-playbook, mc, ...) are opaque child processes
// with stream-captured stdout/stderr, a deadline, and cooperative
// cancellation: terminate first, escalate to kill after a grace period.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AdapterError, Result};

/// Bounded size of captured stdout/stderr tails
pub const TAIL_LIMIT: usize = 64 * 1024;

/// Grace period between terminate and kill
const KILL_GRACE: Duration = Duration::from_secs(10);

static NEVER_CANCELLED: Lazy<watch::Sender<bool>> = Lazy::new(|| watch::channel(false).0);

/// Cooperative cancellation signal scoped to one execution
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// New token plus the handle that triggers it
    pub fn new() -> (watch::Sender<bool>, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (tx, CancelToken { rx })
    }

    /// A token that never fires, for contexts without cancellation
    pub fn never() -> CancelToken {
        CancelToken {
            rx: NEVER_CANCELLED.subscribe(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested; pends forever if the handle
    /// is dropped without firing
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One child-process invocation
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rendered command line for logs and error messages
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a completed child process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    /// Last 64 KiB of stdout
    pub stdout: String,
    /// Last 64 KiB of stderr
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability for invoking arbitrary binaries present on PATH.
///
/// Tests substitute a fake that records calls and returns canned output.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, request: ProcessRequest, cancel: CancelToken) -> Result<ProcessOutput>;
}

/// Production runner on tokio::process
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, request: ProcessRequest, mut cancel: CancelToken) -> Result<ProcessOutput> {
        debug!(command = %request.display(), cwd = ?request.cwd, "spawning child process");

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            AdapterError::permanent(format!("failed to spawn {}: {e}", request.program))
        })?;

        let stdout = capture_tail(child.stdout.take());
        let stderr = capture_tail(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| AdapterError::permanent(format!("wait failed: {e}")))?
            }
            _ = tokio::time::sleep(request.timeout) => {
                warn!(command = %request.display(), "child process deadline exceeded, terminating");
                stop_child(&mut child).await;
                return Err(AdapterError::Timeout);
            }
            _ = cancel.cancelled() => {
                warn!(command = %request.display(), "cancellation requested, terminating child");
                stop_child(&mut child).await;
                return Err(AdapterError::Cancelled);
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// Drain a child stream, retaining only the final TAIL_LIMIT bytes
fn capture_tail<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return String::new();
        };
        let mut tail: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
            tail.extend_from_slice(&buf[..n]);
            if tail.len() > TAIL_LIMIT {
                let excess = tail.len() - TAIL_LIMIT;
                tail.drain(..excess);
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}

/// Terminate, wait out the grace period, then kill
async fn stop_child(child: &mut Child) {
    terminate(child);
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("child ignored terminate signal, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a live child we own; SIGTERM is async-safe
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    // No terminate signal off unix; the grace-period kill handles it
    let _ = child;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = TokioProcessRunner::new();
        let output = runner
            .run(
                ProcessRequest::new("sh", &["-c", "echo hello; echo oops >&2; exit 3"]),
                CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn deadline_terminates_the_child() {
        let runner = TokioProcessRunner::new();
        let err = runner
            .run(
                ProcessRequest::new("sleep", &["30"]).timeout(Duration::from_millis(200)),
                CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let runner = TokioProcessRunner::new();
        let (handle, token) = CancelToken::new();
        let run = tokio::spawn(async move {
            runner
                .run(ProcessRequest::new("sleep", &["30"]), token)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.send(true).unwrap();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, AdapterError::Cancelled));
    }

    #[tokio::test]
    async fn missing_binary_is_permanent() {
        let runner = TokioProcessRunner::new();
        let err = runner
            .run(
                ProcessRequest::new("definitely-not-on-path-xyz", &[]),
                CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)));
    }

    #[tokio::test]
    async fn stdout_tail_is_bounded() {
        let runner = TokioProcessRunner::new();
        let output = runner
            .run(
                // ~130 KiB of output
                ProcessRequest::new("sh", &["-c", "yes x | head -c 131072"]),
                CancelToken::never(),
            )
            .await
            .unwrap();
        assert!(output.stdout.len() <= TAIL_LIMIT);
    }
}
