// Status updater: a single task drains the status channel and persists task
// lifecycle updates, so updates for one execution apply in emission order.
//
// Terminal updates carry an ack; the worker awaits it, which makes every
// error outcome durable before the task is acknowledged.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use scoreflow_core::{OrchestratorStore, TaskStatus};

/// One task status transition
#[derive(Debug)]
pub struct StatusUpdate {
    pub task_id: i64,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    /// Present on terminal updates; fired once the write is durable
    pub ack: Option<oneshot::Sender<()>>,
}

/// Sending half handed to workers
#[derive(Clone)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl StatusSender {
    /// Fire-and-forget, non-terminal update
    pub fn send(&self, task_id: i64, status: TaskStatus, error_message: Option<String>) {
        let _ = self.tx.send(StatusUpdate {
            task_id,
            status,
            error_message,
            ack: None,
        });
    }

    /// Terminal update; resolves once the status is durable
    pub async fn send_final(
        &self,
        task_id: i64,
        status: TaskStatus,
        error_message: Option<String>,
    ) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .tx
            .send(StatusUpdate {
                task_id,
                status,
                error_message,
                ack: Some(ack_tx),
            })
            .is_err()
        {
            return;
        }
        let _ = ack_rx.await;
    }
}

/// Spawn the single status-updater task
pub fn spawn_status_updater(
    store: Arc<dyn OrchestratorStore>,
) -> (StatusSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusUpdate>();
    let handle = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            if let Err(err) = store
                .update_task_status(update.task_id, update.status, update.error_message.clone())
                .await
            {
                error!(
                    task_id = update.task_id,
                    status = %update.status,
                    error = %err,
                    "failed to persist status update"
                );
            }
            if let Some(ack) = update.ack {
                let _ = ack.send(());
            }
        }
        info!("status updater drained");
    });
    (StatusSender { tx }, handle)
}
