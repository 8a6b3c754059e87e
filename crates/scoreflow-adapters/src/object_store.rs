// S3-compatible object-store adapter.
//
// Drives the `mc` CLI through the process runner rather than speaking the
// S3 wire protocol; bucket and policy management is all the bucket steps
// need.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{AdapterError, Result};
use crate::process::{CancelToken, ProcessRequest, ProcessRunner};

const MC_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection settings for one S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// mc alias registered for the endpoint
    pub alias: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Bucket/policy operations against an S3-compatible store
#[derive(Clone)]
pub struct ObjectStoreClient {
    runner: Arc<dyn ProcessRunner>,
    config: ObjectStoreConfig,
}

impl ObjectStoreClient {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ObjectStoreConfig) -> Self {
        Self { runner, config }
    }

    async fn mc(&self, args: &[&str], cancel: CancelToken) -> Result<String> {
        let request = ProcessRequest::new("mc", args).timeout(MC_TIMEOUT);
        let output = self.runner.run(request, cancel).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(AdapterError::permanent(format!(
                "mc {} failed (exit {}): {}",
                args.first().copied().unwrap_or_default(),
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    /// Register the alias for this endpoint; idempotent
    pub async fn ensure_alias(&self, cancel: CancelToken) -> Result<()> {
        self.mc(
            &[
                "alias",
                "set",
                &self.config.alias,
                &self.config.endpoint,
                &self.config.access_key,
                &self.config.secret_key,
            ],
            cancel,
        )
        .await?;
        Ok(())
    }

    /// Create the bucket if absent; presence is success
    pub async fn ensure_bucket(&self, bucket: &str, cancel: CancelToken) -> Result<()> {
        let target = format!("{}/{bucket}", self.config.alias);
        info!(bucket, "ensuring bucket exists");
        self.mc(&["mb", "--ignore-existing", &target], cancel).await?;
        Ok(())
    }

    /// Apply an anonymous-access policy (`none`, `download`, `upload`,
    /// `public`) to the bucket
    pub async fn set_anonymous_policy(
        &self,
        bucket: &str,
        policy: &str,
        cancel: CancelToken,
    ) -> Result<()> {
        let target = format!("{}/{bucket}", self.config.alias);
        self.mc(&["anonymous", "set", policy, &target], cancel)
            .await?;
        Ok(())
    }
}
