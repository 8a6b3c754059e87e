// External Interface Adapters
//
// Thin, stateless adapters exposing typed call contracts to the step
// executor:
// - Gitea repository API (create repo, open PR, poll PR status)
// - ArgoCD REST (authenticate, create application, read status)
// - Terraform Enterprise REST (run status, outputs)
// - Child-process runner (stream-captured, deadline-bounded invocation of
//   binaries on PATH); tests substitute FakeProcessRunner
// - Object store (S3-compatible, via the mc CLI)
//
// Every adapter maps failures to Transient (retried 3x with exponential
// backoff by with_retries) or Permanent (step fails immediately).

pub mod argocd;
pub mod error;
pub mod fake;
pub mod git;
pub mod object_store;
pub mod process;
pub mod retry;
pub mod tfe;

pub use argocd::{AppStatus, ArgoApplication, ArgoCdClient};
pub use error::{AdapterError, Result};
pub use fake::{CannedResponse, FakeProcessRunner};
pub use git::{GiteaClient, PrState, PullRequest, RepoInfo};
pub use object_store::{ObjectStoreClient, ObjectStoreConfig};
pub use process::{CancelToken, ProcessOutput, ProcessRequest, ProcessRunner, TokioProcessRunner};
pub use retry::with_retries;
pub use tfe::{RunState, TfeClient};
