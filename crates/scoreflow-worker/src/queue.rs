// Asynchronous task queue and worker pool.
//
// Bounded mpsc buffer feeding W workers. Each worker loop: claim one task
// durably, execute its workflow to completion, post the final status through
// the status updater (awaiting durability), repeat. Submission reserves a
// buffer slot before persisting, so a saturated buffer fails fast with
// QueueFull and never leaves an orphaned row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use scoreflow_adapters::CancelToken;
use scoreflow_core::{
    ExecutionStatus, NewQueueTask, OrchestratorError, OrchestratorStore, QueueTask, Result,
    StepStatus, TaskStatus,
};

use crate::executor::StepExecutor;
use crate::status::StatusSender;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Worker pool size; also the bound on concurrently running executions
    pub workers: usize,
    /// Submission buffer depth
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            capacity: 100,
        }
    }
}

/// Live queue metrics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub workers: usize,
    pub queue_size: usize,
    pub active: usize,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub avg_queue_time_ms: u64,
    pub avg_execution_time_ms: u64,
}

/// One currently running task
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTaskInfo {
    pub task_id: i64,
    pub app_name: String,
    pub workflow_name: String,
    pub claimed_at: DateTime<Utc>,
}

struct ActiveEntry {
    info: ActiveTaskInfo,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct Counters {
    total_enqueued: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    queue_wait_ms: AtomicU64,
    claims: AtomicU64,
    execution_ms: AtomicU64,
    executions: AtomicU64,
}

/// Bounded queue with a fixed worker pool
pub struct TaskQueue {
    store: Arc<dyn OrchestratorStore>,
    tx: mpsc::Sender<i64>,
    active: Arc<RwLock<HashMap<i64, ActiveEntry>>>,
    counters: Arc<Counters>,
    queue_depth: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    config: QueueConfig,
}

impl TaskQueue {
    /// Start the worker pool
    pub fn start(
        store: Arc<dyn OrchestratorStore>,
        executor: Arc<StepExecutor>,
        status: StatusSender,
        config: QueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<i64>(config.capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (shutdown_tx, _) = watch::channel(false);

        let active: Arc<RwLock<HashMap<i64, ActiveEntry>>> = Arc::new(RwLock::new(HashMap::new()));
        let counters = Arc::new(Counters::default());
        let queue_depth = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                store.clone(),
                executor.clone(),
                status.clone(),
                rx.clone(),
                active.clone(),
                counters.clone(),
                queue_depth.clone(),
                shutdown_tx.subscribe(),
            )));
        }
        info!(workers = config.workers, capacity = config.capacity, "task queue started");

        Self {
            store,
            tx,
            active,
            counters,
            queue_depth,
            shutdown_tx,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
            config,
        }
    }

    /// Submit one resolved workflow. Fails synchronously with QueueFull when
    /// the buffer is saturated.
    pub async fn submit(&self, task: NewQueueTask) -> Result<QueueTask> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Cancelled);
        }

        let permit = match self.tx.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => return Err(OrchestratorError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(())) => {
                return Err(OrchestratorError::Cancelled)
            }
        };

        let task = self.store.enqueue_task(task).await?;
        self.counters.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        permit.send(task.task_id);

        info!(
            task_id = task.task_id,
            app = %task.app_name,
            workflow = %task.workflow_name,
            "task enqueued"
        );
        Ok(task)
    }

    /// Re-dispatch tasks left pending or running by a previous process.
    /// Running tasks without durable step records restart from step 1 with a
    /// recovery warning.
    pub async fn recover(&self) -> Result<usize> {
        let ids = self.store.recoverable_task_ids().await?;
        let mut recovered = 0;
        for task_id in ids {
            let Some(task) = self.store.get_task(task_id).await? else {
                continue;
            };
            if task.status == TaskStatus::Running {
                let steps_recorded = self
                    .store
                    .execution_for_task(task_id)
                    .await?
                    .map(|e| {
                        e.steps
                            .iter()
                            .any(|s| s.status == StepStatus::Completed)
                    })
                    .unwrap_or(false);
                if !steps_recorded {
                    warn!(
                        task_id,
                        app = %task.app_name,
                        "recovery found running task without recoverable step records, restarting from step 1"
                    );
                }
            }
            if self.tx.send(task_id).await.is_err() {
                break;
            }
            self.queue_depth.fetch_add(1, Ordering::SeqCst);
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "re-dispatched recoverable tasks");
        }
        Ok(recovered)
    }

    /// Ask a running task to stop; returns false when it is not active
    pub fn cancel_task(&self, task_id: i64) -> bool {
        let active = self.active.read();
        match active.get(&task_id) {
            Some(entry) => entry.cancel.send(true).is_ok(),
            None => false,
        }
    }

    /// Stop accepting submissions and wait for in-flight tasks to finish.
    /// Buffered tasks stay pending and are re-dispatched on restart.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping task queue");
        let _ = self.shutdown_tx.send(true);

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = %err, "worker join failed");
            }
        }
        info!("task queue stopped");
    }

    /// Cancel every active task, for escalated shutdown
    pub fn cancel_all(&self) {
        let active = self.active.read();
        for entry in active.values() {
            let _ = entry.cancel.send(true);
        }
    }

    pub fn stats(&self) -> QueueStats {
        let claims = self.counters.claims.load(Ordering::Relaxed).max(1);
        let executions = self.counters.executions.load(Ordering::Relaxed).max(1);
        QueueStats {
            workers: self.config.workers,
            queue_size: self.queue_depth.load(Ordering::SeqCst),
            active: self.active.read().len(),
            total_enqueued: self.counters.total_enqueued.load(Ordering::Relaxed),
            total_completed: self.counters.total_completed.load(Ordering::Relaxed),
            total_failed: self.counters.total_failed.load(Ordering::Relaxed),
            avg_queue_time_ms: self.counters.queue_wait_ms.load(Ordering::Relaxed) / claims,
            avg_execution_time_ms: self.counters.execution_ms.load(Ordering::Relaxed) / executions,
        }
    }

    /// Running tasks with their claim timestamps
    pub fn active_tasks(&self) -> Vec<ActiveTaskInfo> {
        let mut tasks: Vec<ActiveTaskInfo> = self
            .active
            .read()
            .values()
            .map(|e| e.info.clone())
            .collect();
        tasks.sort_by_key(|t| (t.claimed_at, t.task_id));
        tasks
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    store: Arc<dyn OrchestratorStore>,
    executor: Arc<StepExecutor>,
    status: StatusSender,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<i64>>>,
    active: Arc<RwLock<HashMap<i64, ActiveEntry>>>,
    counters: Arc<Counters>,
    queue_depth: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let task_id = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = rx.recv() => match received {
                    Some(task_id) => task_id,
                    None => break,
                }
            }
        };
        queue_depth.fetch_sub(1, Ordering::SeqCst);

        process_task(
            worker_id, &store, &executor, &status, &active, &counters, task_id,
        )
        .await;
    }
    info!(worker_id, "worker stopped");
}

async fn process_task(
    worker_id: usize,
    store: &Arc<dyn OrchestratorStore>,
    executor: &Arc<StepExecutor>,
    status: &StatusSender,
    active: &Arc<RwLock<HashMap<i64, ActiveEntry>>>,
    counters: &Arc<Counters>,
    task_id: i64,
) {
    // The claim persists `running` before any step executes; a crash from
    // here on leaves the task recoverable.
    let task = match store.claim_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!(task_id, "task no longer claimable, skipping");
            return;
        }
        Err(err) => {
            error!(task_id, error = %err, "claim failed");
            return;
        }
    };

    let claimed_at = Utc::now();
    counters.claims.fetch_add(1, Ordering::Relaxed);
    counters.queue_wait_ms.fetch_add(
        (claimed_at - task.enqueued_at).num_milliseconds().max(0) as u64,
        Ordering::Relaxed,
    );

    let (cancel_tx, cancel_token) = CancelToken::new();
    active.write().insert(
        task_id,
        ActiveEntry {
            info: ActiveTaskInfo {
                task_id,
                app_name: task.app_name.clone(),
                workflow_name: task.workflow_name.clone(),
                claimed_at,
            },
            cancel: cancel_tx,
        },
    );

    info!(
        worker_id,
        task_id,
        app = %task.app_name,
        workflow = %task.workflow_name,
        "worker claimed task"
    );

    // Panics are isolated: the affected task fails, the pool keeps running.
    let outcome = std::panic::AssertUnwindSafe(executor.execute(&task, cancel_token))
        .catch_unwind()
        .await;

    let (task_status, error_message) = match outcome {
        Ok(outcome) => match outcome.status {
            ExecutionStatus::Completed => (TaskStatus::Completed, None),
            ExecutionStatus::Cancelled => (TaskStatus::Cancelled, outcome.error_message),
            ExecutionStatus::Failed | ExecutionStatus::Running => {
                (TaskStatus::Failed, outcome.error_message)
            }
        },
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker_id, task_id, panic = %message, "worker panic isolated");
            (TaskStatus::Failed, Some(format!("worker panic: {message}")))
        }
    };

    // Durable before the task is acknowledged.
    status
        .send_final(task_id, task_status, error_message)
        .await;

    match task_status {
        TaskStatus::Completed => {
            counters.total_completed.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            counters.total_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    counters.execution_ms.fetch_add(
        (Utc::now() - claimed_at).num_milliseconds().max(0) as u64,
        Ordering::Relaxed,
    );
    counters.executions.fetch_add(1, Ordering::Relaxed);

    active.write().remove(&task_id);
}
