use agentforge_core::{ForgeResult, TaskStatus};
use agentforge_pipeline::{DriveOutcome, WorkflowDriver};
use agentforge_queue::BuildQueue;
use agentforge_store::{update_task_with, StateStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent workflow workers.
    pub max_workflow_workers: usize,
    /// Idle sleep between claim attempts.
    pub poll_interval: Duration,
    /// Lease renewal period; keep well under the queue's visibility timeout.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workflow_workers: 4,
            poll_interval: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Pool of workflow workers over one queue and one driver.
pub struct WorkerPool {
    queue: Arc<BuildQueue>,
    driver: Arc<WorkflowDriver>,
    store: Arc<dyn StateStore>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Build a pool.
    pub fn new(
        queue: Arc<BuildQueue>,
        driver: Arc<WorkflowDriver>,
        store: Arc<dyn StateStore>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            driver,
            store,
            config,
            shutdown_tx,
        }
    }

    /// Spawn the worker loops. The returned handles finish after
    /// [`WorkerPool::shutdown`].
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.max_workflow_workers)
            .map(|i| {
                let pool = Arc::clone(self);
                let worker_id = format!("worker-{i}");
                tokio::spawn(async move { pool.worker_loop(worker_id).await })
            })
            .collect()
    }

    /// Ask all workers to stop after their current task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn worker_loop(&self, worker_id: String) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(worker_id, "Worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if let Err(e) = self.queue.reap_expired().await {
                warn!(worker_id, error = %e, "Lease reaping failed");
            }
            match self.tick(&worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Worker tick failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        info!(worker_id, "Worker stopped");
    }

    /// Claim and drive at most one task. Returns whether work was done.
    /// Exposed for one-shot embedding (CLI `run`, tests).
    pub async fn tick(&self, worker_id: &str) -> ForgeResult<bool> {
        let Some(lease) = self.queue.claim(worker_id).await? else {
            return Ok(false);
        };
        let task_id = lease.task_id.clone();
        let Some(project_id) = lease.project_id.clone() else {
            // Build tasks always carry a project; anything else is noise.
            warn!(task_id, "Task without project; completing as no-op");
            self.queue
                .complete(&task_id, worker_id, serde_json::json!({"skipped": true}))
                .await?;
            return Ok(true);
        };

        let heartbeat = self.spawn_heartbeat(task_id.clone(), worker_id.to_string());
        let outcome = self.driver.drive(&project_id).await;
        heartbeat.abort();

        match outcome {
            Ok(DriveOutcome::Completed) => {
                self.queue
                    .complete(
                        &task_id,
                        worker_id,
                        serde_json::json!({"project_id": project_id, "status": "completed"}),
                    )
                    .await?;
            }
            Ok(DriveOutcome::Failed) => {
                // Stage retries are already exhausted inside the pipeline;
                // the task ends terminally rather than re-running the build.
                update_task_with(self.store.as_ref(), &task_id, |draft| {
                    draft.status = TaskStatus::Failed;
                    draft.completed_at = Some(Utc::now());
                    draft.error_message = Some("build failed".to_string());
                    Ok(())
                })
                .await?;
                self.queue.release(&task_id, worker_id).await?;
            }
            Ok(DriveOutcome::Cancelled) => {
                update_task_with(self.store.as_ref(), &task_id, |draft| {
                    draft.status = TaskStatus::Cancelled;
                    draft.completed_at = Some(Utc::now());
                    Ok(())
                })
                .await?;
                self.queue.release(&task_id, worker_id).await?;
            }
            Ok(DriveOutcome::Paused) => {
                // Park the task; resume re-enqueues it.
                update_task_with(self.store.as_ref(), &task_id, |draft| {
                    draft.status = TaskStatus::Pending;
                    draft.worker_id = None;
                    Ok(())
                })
                .await?;
                self.queue.release(&task_id, worker_id).await?;
            }
            Err(e) => {
                // Infrastructure failure: release and let the queue's retry
                // policy decide.
                warn!(task_id, error = %e, "Drive errored; applying task retry policy");
                self.queue.fail(&task_id, worker_id, &e.to_string()).await?;
            }
        }
        Ok(true)
    }

    fn spawn_heartbeat(&self, task_id: String, worker_id: String) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = queue.heartbeat(&task_id, &worker_id).await {
                    warn!(task_id, worker_id, error = %e, "Heartbeat rejected");
                    break;
                }
            }
        })
    }
}
