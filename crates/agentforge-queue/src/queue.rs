use agentforge_core::{ForgeError, ForgeResult, TaskRecord, TaskStatus};
use agentforge_store::{update_task_with, TaskStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tunable queue policy. The shipped defaults follow the pipeline's
/// suggested values; deployments override per environment.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Submissions beyond this depth are rejected.
    pub max_queue_depth: usize,
    /// Lease duration; a claimed task is re-delivered after this lapses
    /// without a heartbeat.
    pub visibility_timeout: Duration,
    /// First retry delay; doubled per attempt.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_cap: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_queue_depth: 1_000,
            visibility_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// A worker's exclusive right to run a task, renewed by heartbeat.
#[derive(Debug, Clone)]
pub struct Lease {
    pub task_id: String,
    pub worker_id: String,
    pub project_id: Option<String>,
    pub deadline: DateTime<Utc>,
}

/// What `fail` decided for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued with backoff; `retry_count` was incremented.
    Retrying,
    /// Retries exhausted; the task is terminally failed.
    Exhausted,
}

#[derive(Debug, Clone)]
struct Entry {
    task_id: String,
    project_id: Option<String>,
    priority: u8,
    seq: u64,
    not_before: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    ready: Vec<Entry>,
    leases: HashMap<String, Lease>,
    /// Active lease per project: the single-concurrent-build mutex.
    project_leases: HashMap<String, String>,
    next_seq: u64,
}

/// Priority FIFO of build/deploy/invoke work items.
pub struct BuildQueue {
    tasks: Arc<dyn TaskStore>,
    policy: QueuePolicy,
    state: RwLock<QueueState>,
}

impl BuildQueue {
    /// Create a queue over the given task store with default policy.
    pub fn new(tasks: Arc<dyn TaskStore>) -> Self {
        Self::with_policy(tasks, QueuePolicy::default())
    }

    /// Create a queue with an explicit policy.
    pub fn with_policy(tasks: Arc<dyn TaskStore>, policy: QueuePolicy) -> Self {
        Self {
            tasks,
            policy,
            state: RwLock::new(QueueState::default()),
        }
    }

    /// Number of entries waiting (ready or backing off).
    pub async fn depth(&self) -> usize {
        self.state.read().await.ready.len()
    }

    /// Number of active leases.
    pub async fn leased(&self) -> usize {
        self.state.read().await.leases.len()
    }

    /// Enqueue a created task. Transitions its record to `queued`.
    ///
    /// Rejects with a validation error when the configured queue depth is
    /// exceeded (back-pressure on new submissions).
    pub async fn enqueue(&self, task: &TaskRecord) -> ForgeResult<()> {
        {
            let mut state = self.state.write().await;
            if state.ready.len() >= self.policy.max_queue_depth {
                return Err(ForgeError::Validation(format!(
                    "queue depth {} exceeded",
                    self.policy.max_queue_depth
                )));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.ready.push(Entry {
                task_id: task.task_id.clone(),
                project_id: task.project_id.clone(),
                priority: task.priority,
                seq,
                not_before: None,
            });
        }
        update_task_with(self.tasks.as_ref(), &task.task_id, |draft| {
            draft.status = TaskStatus::Queued;
            Ok(())
        })
        .await?;
        debug!(task_id = %task.task_id, priority = task.priority, "Task enqueued");
        Ok(())
    }

    /// Claim the highest-priority ready task for `worker_id`.
    ///
    /// Skips tasks whose project already holds an active lease; returns
    /// `None` when nothing is claimable. Tie-break is priority first, then
    /// FIFO by enqueue order.
    pub async fn claim(&self, worker_id: &str) -> ForgeResult<Option<Lease>> {
        let now = Utc::now();
        let candidate = {
            let mut state = self.state.write().await;
            state
                .ready
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            let position = state.ready.iter().position(|entry| {
                entry.not_before.map_or(true, |t| t <= now)
                    && entry
                        .project_id
                        .as_ref()
                        .map_or(true, |p| !state.project_leases.contains_key(p))
            });
            match position {
                Some(i) => {
                    let entry = state.ready.remove(i);
                    let lease = Lease {
                        task_id: entry.task_id.clone(),
                        worker_id: worker_id.to_string(),
                        project_id: entry.project_id.clone(),
                        deadline: now
                            + ChronoDuration::from_std(self.policy.visibility_timeout)
                                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
                    };
                    state.leases.insert(entry.task_id.clone(), lease.clone());
                    if let Some(project_id) = &entry.project_id {
                        state
                            .project_leases
                            .insert(project_id.clone(), entry.task_id.clone());
                    }
                    Some(lease)
                }
                None => None,
            }
        };

        let Some(lease) = candidate else {
            return Ok(None);
        };

        match self.tasks.claim_task(&lease.task_id, worker_id).await {
            Ok(_) => {
                debug!(task_id = %lease.task_id, worker_id, "Task claimed");
                Ok(Some(lease))
            }
            Err(e) => {
                // The record refused the claim (terminal or held elsewhere);
                // drop the local lease and report nothing claimable.
                warn!(task_id = %lease.task_id, error = %e, "Record claim refused, dropping entry");
                self.release_lease(&lease.task_id).await;
                Ok(None)
            }
        }
    }

    /// Extend a lease. Fails with a conflict unless `worker_id` holds it.
    pub async fn heartbeat(&self, task_id: &str, worker_id: &str) -> ForgeResult<()> {
        self.tasks.heartbeat_task(task_id, worker_id).await?;
        let mut state = self.state.write().await;
        let lease = state
            .leases
            .get_mut(task_id)
            .ok_or_else(|| ForgeError::Conflict(format!("no lease for task {task_id}")))?;
        if lease.worker_id != worker_id {
            return Err(ForgeError::Conflict(format!(
                "lease for task {task_id} is held by {}",
                lease.worker_id
            )));
        }
        lease.deadline = Utc::now()
            + ChronoDuration::from_std(self.policy.visibility_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(60));
        Ok(())
    }

    /// Mark a leased task completed and release the lease.
    pub async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> ForgeResult<()> {
        self.ensure_holder(task_id, worker_id).await?;
        update_task_with(self.tasks.as_ref(), task_id, |draft| {
            draft.status = TaskStatus::Completed;
            draft.completed_at = Some(Utc::now());
            draft.result = Some(result.clone());
            Ok(())
        })
        .await?;
        self.release_lease(task_id).await;
        info!(task_id, "Task completed");
        Ok(())
    }

    /// Record a failure. Retries with exponential backoff until
    /// `max_retries` is exhausted, then fails the task terminally.
    pub async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
    ) -> ForgeResult<FailOutcome> {
        self.ensure_holder(task_id, worker_id).await?;
        let task = self.tasks.get_task(task_id).await?;
        let outcome = if task.retry_count < task.max_retries {
            FailOutcome::Retrying
        } else {
            FailOutcome::Exhausted
        };

        let updated = update_task_with(self.tasks.as_ref(), task_id, |draft| {
            draft.error_message = Some(error.to_string());
            match outcome {
                FailOutcome::Retrying => {
                    draft.retry_count += 1;
                    draft.status = TaskStatus::Queued;
                    draft.worker_id = None;
                }
                FailOutcome::Exhausted => {
                    draft.status = TaskStatus::Failed;
                    draft.completed_at = Some(Utc::now());
                }
            }
            Ok(())
        })
        .await?;
        self.release_lease(task_id).await;

        if outcome == FailOutcome::Retrying {
            let delay = self.backoff_delay(updated.retry_count);
            let mut state = self.state.write().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.ready.push(Entry {
                task_id: updated.task_id.clone(),
                project_id: updated.project_id.clone(),
                priority: updated.priority,
                seq,
                not_before: Some(
                    Utc::now()
                        + ChronoDuration::from_std(delay)
                            .unwrap_or_else(|_| ChronoDuration::seconds(60)),
                ),
            });
            info!(
                task_id,
                retry = updated.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Task re-queued with backoff"
            );
        } else {
            warn!(task_id, error, "Task failed, retries exhausted");
        }
        Ok(outcome)
    }

    /// Release a lease without touching the task record. Used when pausing:
    /// the project leaves the queue cleanly and the task is re-enqueued on
    /// resume.
    pub async fn release(&self, task_id: &str, worker_id: &str) -> ForgeResult<()> {
        self.ensure_holder(task_id, worker_id).await?;
        self.release_lease(task_id).await;
        Ok(())
    }

    /// Cancel a waiting task (remove from the ready set, mark cancelled).
    /// Leased tasks are not touched; the holder observes the stop flag.
    pub async fn cancel(&self, task_id: &str) -> ForgeResult<()> {
        {
            let mut state = self.state.write().await;
            state.ready.retain(|e| e.task_id != task_id);
        }
        let task = self.tasks.get_task(task_id).await?;
        if !task.status.is_terminal() && task.status != TaskStatus::Running {
            update_task_with(self.tasks.as_ref(), task_id, |draft| {
                draft.status = TaskStatus::Cancelled;
                draft.completed_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Return expired leases to the ready set and report the affected task
    /// ids. Called periodically by the worker pool.
    pub async fn reap_expired(&self) -> ForgeResult<Vec<String>> {
        let now = Utc::now();
        let expired: Vec<Lease> = {
            let state = self.state.read().await;
            state
                .leases
                .values()
                .filter(|l| l.deadline <= now)
                .cloned()
                .collect()
        };

        let mut reaped = Vec::new();
        for lease in expired {
            warn!(task_id = %lease.task_id, worker_id = %lease.worker_id, "Lease expired, re-delivering");
            let record = update_task_with(self.tasks.as_ref(), &lease.task_id, |draft| {
                if draft.status == TaskStatus::Running {
                    draft.status = TaskStatus::Queued;
                    draft.worker_id = None;
                }
                Ok(())
            })
            .await?;
            {
                let mut state = self.state.write().await;
                state.leases.remove(&lease.task_id);
                if let Some(project_id) = &lease.project_id {
                    state.project_leases.remove(project_id);
                }
                let seq = state.next_seq;
                state.next_seq += 1;
                state.ready.push(Entry {
                    task_id: lease.task_id.clone(),
                    project_id: lease.project_id.clone(),
                    priority: record.priority,
                    seq,
                    not_before: None,
                });
            }
            reaped.push(lease.task_id);
        }
        Ok(reaped)
    }

    /// Re-enqueue an existing task (resume / restart path).
    pub async fn requeue(&self, task_id: &str) -> ForgeResult<()> {
        let task = self.tasks.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(ForgeError::Conflict(format!(
                "task {task_id} is terminal and cannot be re-queued"
            )));
        }
        let already_waiting = {
            let state = self.state.read().await;
            state.ready.iter().any(|e| e.task_id == task_id)
                || state.leases.contains_key(task_id)
        };
        if already_waiting {
            return Ok(());
        }
        self.enqueue(&task).await
    }

    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(16);
        let delay = self.policy.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.policy.backoff_cap)
    }

    async fn ensure_holder(&self, task_id: &str, worker_id: &str) -> ForgeResult<()> {
        let state = self.state.read().await;
        match state.leases.get(task_id) {
            Some(lease) if lease.worker_id == worker_id => Ok(()),
            Some(lease) => Err(ForgeError::Conflict(format!(
                "task {task_id} is leased to {}",
                lease.worker_id
            ))),
            None => Err(ForgeError::Conflict(format!("no lease for task {task_id}"))),
        }
    }

    async fn release_lease(&self, task_id: &str) {
        let mut state = self.state.write().await;
        if let Some(lease) = state.leases.remove(task_id) {
            if let Some(project_id) = &lease.project_id {
                state.project_leases.remove(project_id);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentforge_store::MemoryStateStore;

    fn fast_policy() -> QueuePolicy {
        QueuePolicy {
            max_queue_depth: 4,
            visibility_timeout: Duration::from_millis(50),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
        }
    }

    async fn queue_with(policy: QueuePolicy) -> (Arc<MemoryStateStore>, BuildQueue) {
        let store = Arc::new(MemoryStateStore::new());
        let queue = BuildQueue::with_policy(store.clone(), policy);
        (store, queue)
    }

    async fn make_task(store: &MemoryStateStore, project: &str, priority: u8) -> TaskRecord {
        let task = TaskRecord::build_for(project, priority);
        store.create_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let (store, queue) = queue_with(fast_policy()).await;
        let low = make_task(&store, "p-low", 1).await;
        let high_a = make_task(&store, "p-high-a", 5).await;
        let high_b = make_task(&store, "p-high-b", 5).await;
        queue.enqueue(&low).await.unwrap();
        queue.enqueue(&high_a).await.unwrap();
        queue.enqueue(&high_b).await.unwrap();

        let first = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(first.task_id, high_a.task_id);
        let second = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(second.task_id, high_b.task_id);
        let third = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(third.task_id, low.task_id);
    }

    #[tokio::test]
    async fn test_depth_limit_rejects() {
        let (store, queue) = queue_with(fast_policy()).await;
        for i in 0..4 {
            let task = make_task(&store, &format!("p-{i}"), 3).await;
            queue.enqueue(&task).await.unwrap();
        }
        let overflow = make_task(&store, "p-overflow", 3).await;
        assert!(matches!(
            queue.enqueue(&overflow).await,
            Err(ForgeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_project_mutex_blocks_second_build() {
        let (store, queue) = queue_with(fast_policy()).await;
        let first = make_task(&store, "p-1", 3).await;
        let second = make_task(&store, "p-1", 3).await;
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let lease = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(lease.task_id, first.task_id);
        // Same project: the second build task is not claimable.
        assert!(queue.claim("w2").await.unwrap().is_none());

        queue
            .complete(&first.task_id, "w1", serde_json::json!({}))
            .await
            .unwrap();
        let next = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(next.task_id, second.task_id);
    }

    #[tokio::test]
    async fn test_fail_retries_with_backoff_then_exhausts() {
        let (store, queue) = queue_with(fast_policy()).await;
        let mut task = TaskRecord::build_for("p-1", 3);
        task.max_retries = 1;
        store.create_task(&task).await.unwrap();
        queue.enqueue(&task).await.unwrap();

        let lease = queue.claim("w1").await.unwrap().unwrap();
        let outcome = queue.fail(&lease.task_id, "w1", "boom").await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying);

        // Not claimable until the backoff delay passes.
        assert!(queue.claim("w1").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let lease = queue.claim("w1").await.unwrap().unwrap();

        let outcome = queue.fail(&lease.task_id, "w1", "boom again").await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted);
        let record = store.get_task(&task.task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_lease_expiry_redelivers() {
        let (store, queue) = queue_with(fast_policy()).await;
        let task = make_task(&store, "p-1", 3).await;
        queue.enqueue(&task).await.unwrap();

        let lease = queue.claim("w1").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let reaped = queue.reap_expired().await.unwrap();
        assert_eq!(reaped, vec![lease.task_id.clone()]);

        // Re-delivered to another worker.
        let lease2 = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(lease2.task_id, task.task_id);
        assert_eq!(lease2.worker_id, "w2");
    }

    #[tokio::test]
    async fn test_heartbeat_extends_lease() {
        let (store, queue) = queue_with(fast_policy()).await;
        let task = make_task(&store, "p-1", 3).await;
        queue.enqueue(&task).await.unwrap();
        let lease = queue.claim("w1").await.unwrap().unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            queue.heartbeat(&lease.task_id, "w1").await.unwrap();
        }
        // 90ms elapsed but heartbeats kept the lease alive.
        assert!(queue.reap_expired().await.unwrap().is_empty());

        // Only the holder may heartbeat.
        assert!(queue.heartbeat(&lease.task_id, "w2").await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_task_never_redelivered() {
        let (store, queue) = queue_with(fast_policy()).await;
        let task = make_task(&store, "p-1", 3).await;
        queue.enqueue(&task).await.unwrap();
        let lease = queue.claim("w1").await.unwrap().unwrap();
        queue
            .complete(&lease.task_id, "w1", serde_json::json!({"ok": true}))
            .await
            .unwrap();

        assert!(queue.claim("w1").await.unwrap().is_none());
        assert!(matches!(
            queue.requeue(&task.task_id).await,
            Err(ForgeError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_release_keeps_task_claimable() {
        let (store, queue) = queue_with(fast_policy()).await;
        let task = make_task(&store, "p-1", 3).await;
        queue.enqueue(&task).await.unwrap();
        let lease = queue.claim("w1").await.unwrap().unwrap();

        // Pause path: release the lease, then requeue.
        queue.release(&lease.task_id, "w1").await.unwrap();
        assert_eq!(queue.leased().await, 0);
        queue.requeue(&task.task_id).await.unwrap();
        let lease2 = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(lease2.task_id, task.task_id);
    }
}
