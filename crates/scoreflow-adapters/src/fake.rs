// Fake process runner for tests and examples.
//
// Records every invocation and replies with canned output matched by
// program name (optionally program + first argument). Unmatched commands
// succeed with empty output, so tests only script what they assert on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{AdapterError, Result};
use crate::process::{CancelToken, ProcessOutput, ProcessRequest, ProcessRunner};

/// A scripted reply
#[derive(Debug, Clone)]
pub struct CannedResponse {
    /// Match on program name
    pub program: String,
    /// Optional additional match on the first argument
    pub first_arg: Option<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Simulated run time before replying
    pub delay: Duration,
}

impl CannedResponse {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            first_arg: None,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn first_arg(mut self, arg: impl Into<String>) -> Self {
        self.first_arg = Some(arg.into());
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn stdout(mut self, out: impl Into<String>) -> Self {
        self.stdout = out.into();
        self
    }

    pub fn stderr(mut self, err: impl Into<String>) -> Self {
        self.stderr = err.into();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn matches(&self, request: &ProcessRequest) -> bool {
        if self.program != request.program {
            return false;
        }
        match &self.first_arg {
            Some(arg) => request.args.first() == Some(arg),
            None => true,
        }
    }
}

/// In-memory [`ProcessRunner`] that records calls and returns canned output
#[derive(Clone, Default)]
pub struct FakeProcessRunner {
    calls: Arc<Mutex<Vec<ProcessRequest>>>,
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
}

impl FakeProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted reply; consumed once when matched
    pub async fn respond(&self, response: CannedResponse) {
        self.responses.lock().await.push_back(response);
    }

    /// Every request seen so far, in order
    pub async fn calls(&self) -> Vec<ProcessRequest> {
        self.calls.lock().await.clone()
    }

    /// Requests for one program, rendered as command lines
    pub async fn command_lines(&self, program: &str) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|r| r.program == program)
            .map(ProcessRequest::display)
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for FakeProcessRunner {
    async fn run(&self, request: ProcessRequest, mut cancel: CancelToken) -> Result<ProcessOutput> {
        self.calls.lock().await.push(request.clone());

        let response = {
            let mut responses = self.responses.lock().await;
            responses
                .iter()
                .position(|r| r.matches(&request))
                .and_then(|i| responses.remove(i))
        };

        let response = response.unwrap_or_else(|| CannedResponse::new(&request.program));

        if !response.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(response.delay) => {}
                _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            }
        } else if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        Ok(ProcessOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_canned_responses_in_match_order() {
        let runner = FakeProcessRunner::new();
        runner
            .respond(
                CannedResponse::new("terraform")
                    .first_arg("apply")
                    .exit_code(1)
                    .stderr("boom"),
            )
            .await;

        let ok = runner
            .run(
                ProcessRequest::new("terraform", &["init"]),
                CancelToken::never(),
            )
            .await
            .unwrap();
        assert!(ok.success(), "unmatched commands default to success");

        let failed = runner
            .run(
                ProcessRequest::new("terraform", &["apply"]),
                CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(failed.exit_code, 1);
        assert_eq!(failed.stderr, "boom");

        assert_eq!(runner.calls().await.len(), 2);
    }
}
