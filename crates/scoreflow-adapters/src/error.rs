// Adapter error taxonomy.
//
// Transport errors collapse into two categories: Transient (the executor
// retries up to 3 times with exponential backoff) and Permanent (the step
// fails immediately). Timeout and Cancelled are execution-control outcomes
// surfaced separately so the executor can report them distinctly.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AdapterError>;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network-ish failure; safe to retry
    #[error("transient adapter error: {0}")]
    Transient(String),

    /// Definitive failure; retrying will not help
    #[error("permanent adapter error: {0}")]
    Permanent(String),

    /// The invocation exceeded its deadline
    #[error("timeout")]
    Timeout,

    /// The invocation was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn transient(msg: impl Into<String>) -> Self {
        AdapterError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        AdapterError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// Map a reqwest transport error: timeouts and connection failures are
/// retryable, everything else is not
impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            AdapterError::Transient(err.to_string())
        } else {
            AdapterError::Permanent(err.to_string())
        }
    }
}

/// Classify an HTTP response status: 5xx and 429 are transient, other
/// non-success statuses are permanent
pub fn check_status(context: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() || status.as_u16() == 429 {
        Err(AdapterError::transient(format!("{context}: HTTP {status}")))
    } else {
        Err(AdapterError::permanent(format!("{context}: HTTP {status}")))
    }
}
