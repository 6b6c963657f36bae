//! Task orchestrator.
//!
//! Runs inference off the request path on a bounded worker pool. Each task
//! targets one fingerprint and carries its own retry state; failed attempts
//! go back on a backoff schedule under the same task id until the attempt
//! budget is spent.
//!
//! Invariant: at most one task per fingerprint is non-terminal, and a task is
//! either in the ready queue, on the backoff schedule, or running, never two
//! of these at once. Together these give at most one in-flight attempt per
//! fingerprint.

use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::db::StoreError;
use crate::models::record::{Diagnosis, Fingerprint, RecordState, ResultRecord};
use crate::models::task::{Task, TaskId, TaskPoll, TaskStatus};
use crate::services::cache::FingerprintCache;
use crate::services::inference::{InferenceAdapter, InferenceError};
use crate::services::recommendations::recommendation_for;
use crate::services::storage::{ImageStore, StorageError};

/// Retry budget and backoff for inference attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt: `base * 2^attempt_count`, capped.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        2u32.checked_pow(attempt_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker_pool_size: usize,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    /// How long terminal tasks stay pollable.
    pub task_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(120),
            task_retention: Duration::from_secs(3600),
        }
    }
}

/// Backoff entry; reversed ordering turns `BinaryHeap` into a min-heap on `run_at`.
#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    run_at: Instant,
    task_id: TaskId,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other.run_at.cmp(&self.run_at)
    }
}

#[derive(Default)]
struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    /// Most recent task per fingerprint.
    latest: HashMap<Fingerprint, TaskId>,
    ready: VecDeque<TaskId>,
    scheduled: BinaryHeap<Scheduled>,
    finished_at: HashMap<TaskId, Instant>,
    /// Completed record as of the moment each succeeded task finished.
    results: HashMap<TaskId, ResultRecord>,
}

impl TaskQueue {
    fn promote_due(&mut self, now: Instant) {
        while self.scheduled.peek().is_some_and(|s| s.run_at <= now) {
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.task_id);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        self.scheduled.peek().map(|s| s.run_at)
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.scheduled.len()
    }

    fn finish(&mut self, task_id: TaskId, status: TaskStatus, error: Option<String>) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = status;
            task.last_error = error;
            task.updated_at = Utc::now();
            self.finished_at.insert(task_id, Instant::now());
        }
    }

    fn prune_finished(&mut self, now: Instant, retention: Duration) {
        let expired: Vec<TaskId> = self
            .finished_at
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= retention)
            .map(|(id, _)| *id)
            .collect();

        for task_id in expired {
            self.finished_at.remove(&task_id);
            self.results.remove(&task_id);
            if let Some(task) = self.tasks.remove(&task_id) {
                if self.latest.get(&task.target_fingerprint) == Some(&task_id) {
                    self.latest.remove(&task.target_fingerprint);
                }
            }
        }
    }
}

enum Next {
    Run(TaskId),
    Wait(Option<Instant>),
}

pub struct TaskOrchestrator {
    cache: Arc<FingerprintCache>,
    images: Arc<dyn ImageStore>,
    adapter: Arc<InferenceAdapter>,
    config: OrchestratorConfig,
    queue: Mutex<TaskQueue>,
    wakeup: Notify,
    workers: Arc<Semaphore>,
}

impl TaskOrchestrator {
    pub fn new(
        cache: Arc<FingerprintCache>,
        images: Arc<dyn ImageStore>,
        adapter: Arc<InferenceAdapter>,
        config: OrchestratorConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            cache,
            images,
            adapter,
            config,
            queue: Mutex::new(TaskQueue::default()),
            wakeup: Notify::new(),
            workers,
        }
    }

    /// Queue inference for a fingerprint, or join the task already covering it.
    ///
    /// A new task is created only when the fingerprint has no task yet or its
    /// latest task has failed.
    pub async fn submit(&self, fingerprint: Fingerprint) -> TaskId {
        let mut queue = self.queue.lock().await;

        let previous = queue
            .latest
            .get(&fingerprint)
            .and_then(|id| queue.tasks.get(id))
            .map(|task| (task.task_id, task.status));

        if let Some((previous_id, status)) = previous {
            if status != TaskStatus::Failed {
                tracing::debug!(
                    task_id = %previous_id,
                    fingerprint = %fingerprint.short(),
                    status = ?status,
                    "Submission coalesced into existing task"
                );
                return previous_id;
            }

            // The caller may have read the record before the failed task wrote it.
            if let Err(e) = self.cache.reopen_failed(&fingerprint).await {
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Failed to reopen record for resubmission"
                );
            }
        }

        let task = Task::queued(fingerprint.clone());
        let task_id = task.task_id;
        queue.tasks.insert(task_id, task);
        queue.latest.insert(fingerprint.clone(), task_id);
        queue.ready.push_back(task_id);
        metrics::gauge!("inference_queue_depth").set(queue.depth() as f64);
        drop(queue);

        self.wakeup.notify_one();
        tracing::info!(task_id = %task_id, fingerprint = %fingerprint.short(), "Inference task queued");
        task_id
    }

    /// Non-blocking status check. A succeeded task keeps answering with the
    /// record as it was when the task finished.
    pub async fn poll(&self, task_id: TaskId) -> Result<TaskPoll, OrchestratorError> {
        let (task, snapshot) = {
            let queue = self.queue.lock().await;
            let task = queue
                .tasks
                .get(&task_id)
                .cloned()
                .ok_or(OrchestratorError::TaskNotFound(task_id))?;
            (task, queue.results.get(&task_id).cloned())
        };

        match task.status {
            TaskStatus::Queued | TaskStatus::Running => Ok(TaskPoll::Processing),
            TaskStatus::Failed => Ok(TaskPoll::Failed {
                error: task
                    .last_error
                    .unwrap_or_else(|| "inference failed".to_string()),
            }),
            TaskStatus::Succeeded => {
                if let Some(record) = snapshot {
                    return Ok(TaskPoll::Completed { record });
                }
                match self.cache.lookup(&task.target_fingerprint).await? {
                    Some(record) if record.state == RecordState::Completed => {
                        let mut queue = self.queue.lock().await;
                        let record = if queue.tasks.contains_key(&task_id) {
                            queue.results.entry(task_id).or_insert(record).clone()
                        } else {
                            record
                        };
                        Ok(TaskPoll::Completed { record })
                    }
                    _ => Ok(TaskPoll::Failed {
                        error: "result record is no longer available".to_string(),
                    }),
                }
            }
        }
    }

    /// Snapshot of a task.
    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        self.queue.lock().await.tasks.get(&task_id).cloned()
    }

    /// Tasks currently tracked, terminal ones included.
    pub async fn task_count(&self) -> usize {
        self.queue.lock().await.tasks.len()
    }

    /// Tasks waiting to run, including those backing off.
    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.depth()
    }

    /// Resubmit every record still pending, e.g. after a restart.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let pending = self.cache.pending().await?;
        for fingerprint in &pending {
            self.submit(fingerprint.clone()).await;
        }
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Resubmitted pending records");
        }
        Ok(pending.len())
    }

    /// Stop dispatching. [`run`](Self::run) returns once running attempts finish.
    pub fn shutdown(&self) {
        self.workers.close();
        self.wakeup.notify_one();
    }

    /// Dispatch loop. Returns after [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            workers = self.config.worker_pool_size,
            max_attempts = self.config.retry.max_attempts,
            "Task orchestrator started"
        );

        let mut in_flight = JoinSet::new();
        loop {
            while in_flight.try_join_next().is_some() {}

            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };

            let next = {
                let mut queue = self.queue.lock().await;
                let now = Instant::now();
                queue.promote_due(now);
                queue.prune_finished(now, self.config.task_retention);
                match queue.ready.pop_front() {
                    Some(task_id) => Next::Run(task_id),
                    None => Next::Wait(queue.next_wake()),
                }
            };

            match next {
                Next::Run(task_id) => {
                    let this = Arc::clone(&self);
                    in_flight.spawn(async move {
                        this.execute(task_id).await;
                        drop(permit);
                    });
                }
                Next::Wait(deadline) => {
                    drop(permit);
                    match deadline {
                        Some(at) => {
                            tokio::select! {
                                _ = self.wakeup.notified() => {}
                                _ = tokio::time::sleep_until(at) => {}
                            }
                        }
                        None => self.wakeup.notified().await,
                    }
                    if self.workers.is_closed() {
                        break;
                    }
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            tracing::info!(attempts = draining, "Waiting for running attempts to finish");
        }
        while in_flight.join_next().await.is_some() {}
        tracing::info!("Task orchestrator stopped");
    }

    async fn execute(&self, task_id: TaskId) {
        let (fingerprint, attempt) = {
            let mut queue = self.queue.lock().await;
            let Some(task) = queue.tasks.get_mut(&task_id) else {
                return;
            };
            task.status = TaskStatus::Running;
            task.attempt_count += 1;
            task.updated_at = Utc::now();
            let claimed = (task.target_fingerprint.clone(), task.attempt_count);
            metrics::gauge!("inference_queue_depth").set(queue.depth() as f64);
            claimed
        };

        metrics::counter!("inference_attempts_total").increment(1);
        tracing::info!(
            task_id = %task_id,
            fingerprint = %fingerprint.short(),
            attempt,
            "Running inference attempt"
        );

        let started = Instant::now();
        let timeout = self.config.attempt_timeout;
        let outcome = match tokio::time::timeout(timeout, self.attempt(&fingerprint, started)).await
        {
            Ok(result) => result,
            Err(_) => Err(AttemptError::Inference(InferenceError::Timeout(timeout))),
        };

        match outcome {
            Ok(diagnosis) => self.succeed(task_id, &fingerprint, attempt, diagnosis).await,
            Err(error) => self.fail(task_id, &fingerprint, attempt, error).await,
        }
    }

    async fn attempt(
        &self,
        fingerprint: &Fingerprint,
        started: Instant,
    ) -> Result<Diagnosis, AttemptError> {
        let record = self
            .cache
            .lookup(fingerprint)
            .await?
            .ok_or_else(|| AttemptError::MissingRecord(fingerprint.clone()))?;
        let image = self.images.local_path(&record.image_key).await?;

        let classification = self.adapter.classify(&image).await?;
        let recommendation = recommendation_for(classification.label);

        Ok(Diagnosis {
            label: classification.label,
            confidence: classification.confidence,
            urgency: recommendation.urgency,
            recommendation,
            inference_ms: classification.latency.as_secs_f64() * 1000.0,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    async fn succeed(
        &self,
        task_id: TaskId,
        fingerprint: &Fingerprint,
        attempt: u32,
        diagnosis: Diagnosis,
    ) {
        // The record is written before the task turns terminal, so a
        // `succeeded` poll always finds the completed record.
        match self.cache.record_diagnosis(fingerprint, &diagnosis).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                task_id = %task_id,
                fingerprint = %fingerprint.short(),
                "Record was no longer pending, diagnosis discarded"
            ),
            Err(e) => return self.fail(task_id, fingerprint, attempt, e.into()).await,
        }

        // Without a snapshot, the first poll takes one instead.
        let snapshot = match self.cache.lookup(fingerprint).await {
            Ok(record) => record.filter(|r| r.state == RecordState::Completed),
            Err(e) => {
                tracing::warn!(
                    task_id = %task_id,
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Could not read back completed record"
                );
                None
            }
        };

        {
            let mut queue = self.queue.lock().await;
            queue.finish(task_id, TaskStatus::Succeeded, None);
            if let Some(record) = snapshot {
                queue.results.insert(task_id, record);
            }
        }

        metrics::counter!("inference_tasks_completed").increment(1);
        metrics::histogram!("inference_processing_seconds")
            .record(diagnosis.processing_time_ms / 1000.0);
        tracing::info!(
            task_id = %task_id,
            fingerprint = %fingerprint.short(),
            attempt,
            label = %diagnosis.label,
            confidence = diagnosis.confidence,
            processing_ms = diagnosis.processing_time_ms,
            "Inference task succeeded"
        );
    }

    async fn fail(
        &self,
        task_id: TaskId,
        fingerprint: &Fingerprint,
        attempt: u32,
        error: AttemptError,
    ) {
        let message = error.to_string();

        if self.config.retry.should_retry(attempt) {
            let delay = self.config.retry.next_delay(attempt);
            {
                let mut queue = self.queue.lock().await;
                if let Some(task) = queue.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Queued;
                    task.last_error = Some(message.clone());
                    task.updated_at = Utc::now();
                }
                queue.scheduled.push(Scheduled {
                    run_at: Instant::now() + delay,
                    task_id,
                });
                metrics::gauge!("inference_queue_depth").set(queue.depth() as f64);
            }
            self.wakeup.notify_one();

            tracing::warn!(
                task_id = %task_id,
                fingerprint = %fingerprint.short(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "Inference attempt failed, retry scheduled"
            );
            return;
        }

        let terminal = format!("Inference failed after {attempt} attempts: {message}");
        {
            // Held across both writes: a submit must never see a failed
            // record while this task still looks alive.
            let mut queue = self.queue.lock().await;
            if let Err(e) = self.cache.record_failure(fingerprint, &terminal).await {
                tracing::error!(
                    task_id = %task_id,
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Failed to mark record as failed"
                );
            }
            queue.finish(task_id, TaskStatus::Failed, Some(terminal));
        }

        metrics::counter!("inference_tasks_failed").increment(1);
        tracing::error!(
            task_id = %task_id,
            fingerprint = %fingerprint.short(),
            attempt,
            error = %message,
            "Inference task failed after max attempts"
        );
    }
}

/// Why a single attempt failed. Every variant is retried.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("No result record for fingerprint {0}")]
    MissingRecord(Fingerprint),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(4));
        assert_eq!(policy.next_delay(2), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.next_delay(5), Duration::from_secs(30));
        assert_eq!(policy.next_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_schedule_promotes_earliest_first() {
        let mut queue = TaskQueue::default();
        let now = Instant::now();
        let late = TaskId::new();
        let early = TaskId::new();
        queue.scheduled.push(Scheduled {
            run_at: now + Duration::from_millis(20),
            task_id: late,
        });
        queue.scheduled.push(Scheduled {
            run_at: now + Duration::from_millis(10),
            task_id: early,
        });

        assert_eq!(queue.next_wake(), Some(now + Duration::from_millis(10)));
        queue.promote_due(now + Duration::from_millis(15));
        assert_eq!(queue.ready, VecDeque::from([early]));
        queue.promote_due(now + Duration::from_millis(25));
        assert_eq!(queue.ready, VecDeque::from([early, late]));
    }

    #[test]
    fn test_prune_drops_expired_terminal_tasks() {
        let mut queue = TaskQueue::default();
        let task = Task::queued(Fingerprint::of(b"a"));
        let task_id = task.task_id;
        queue.latest.insert(task.target_fingerprint.clone(), task_id);
        queue.tasks.insert(task_id, task);
        queue.finish(task_id, TaskStatus::Succeeded, None);

        queue.prune_finished(Instant::now(), Duration::from_secs(60));
        assert!(queue.tasks.contains_key(&task_id));

        queue
            .results
            .insert(task_id, ResultRecord::pending(Fingerprint::of(b"a"), "k"));

        queue.prune_finished(Instant::now() + Duration::from_secs(61), Duration::from_secs(60));
        assert!(queue.tasks.is_empty());
        assert!(queue.results.is_empty());
        assert!(queue.latest.is_empty());
    }
}
