//! Request queue
//!
//! Asynchronous path: callers enqueue a request with a priority and poll
//! its task status. A fixed pool of workers takes the highest-priority,
//! oldest ready item and hands it to a [`CompletionRunner`]. Retryable
//! failures are parked with a backoff in a separate delayed heap so they
//! never block unrelated items.

mod task;

pub use task::{Priority, TaskState, TaskStatus};

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use task::{Delayed, QueueItem, Ready};

use crate::error::{EngineError, EngineResult};
use crate::executor::{backoff_delay, CompleteOptions, Completion};
use crate::telemetry::export;
use crate::types::LlmRequest;

/// Whatever runs one request to completion; the engine in production
#[async_trait]
pub trait CompletionRunner: Send + Sync + 'static {
    async fn run(&self, request: LlmRequest, options: CompleteOptions) -> EngineResult<Completion>;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    /// Retries after the first run
    pub max_retries: u32,
    /// Maximum unfinished tasks
    pub capacity: usize,
    /// How long finished tasks stay queryable
    pub retention: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            capacity: 10_000,
            retention: Duration::from_secs(3600),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Schedule {
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Delayed>,
}

impl Schedule {
    /// Move every delayed item whose time has come into the ready heap
    fn promote(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|d| d.0.eligible_at <= now)
        {
            if let Some(Delayed(item)) = self.delayed.pop() {
                self.ready.push(Ready(item));
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.0.eligible_at)
    }
}

struct Shared {
    config: QueueConfig,
    runner: Arc<dyn CompletionRunner>,
    schedule: Mutex<Schedule>,
    tasks: DashMap<Uuid, TaskStatus>,
    /// Unfinished tasks: queued, running or retrying
    active: AtomicUsize,
    seq: AtomicU64,
    notify: Notify,
    shutdown: watch::Sender<bool>,
}

/// Priority queue with a worker pool
pub struct RequestQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestQueue {
    /// Create the queue and spawn its workers on the current runtime
    pub fn start(config: QueueConfig, runner: Arc<dyn CompletionRunner>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            config,
            runner,
            schedule: Mutex::new(Schedule::default()),
            tasks: DashMap::new(),
            active: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            shutdown,
        });

        info!(workers = worker_count, "Starting request queue workers");
        let workers = (0..worker_count)
            .map(|worker| tokio::spawn(worker_loop(shared.clone(), worker)))
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a request; fails with `QueueFull` rather than dropping it
    pub fn enqueue(&self, request: LlmRequest, priority: Priority) -> EngineResult<Uuid> {
        self.enqueue_with(request, priority, CompleteOptions::default())
    }

    pub fn enqueue_with(
        &self,
        request: LlmRequest,
        priority: Priority,
        options: CompleteOptions,
    ) -> EngineResult<Uuid> {
        if *self.shared.shutdown.borrow() {
            return Err(EngineError::QueueClosed);
        }
        if request.is_empty() {
            return Err(EngineError::BadRequest("request has no content".into()));
        }
        let capacity = self.shared.config.capacity;
        let reserved = self
            .shared
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            warn!(capacity = capacity, "Request queue is full");
            return Err(EngineError::QueueFull);
        }

        let id = Uuid::new_v4();
        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
        self.shared.tasks.insert(id, TaskStatus::queued(id, priority));
        self.shared.schedule.lock().ready.push(Ready(QueueItem {
            id,
            priority,
            seq,
            retries: 0,
            eligible_at: Instant::now(),
            request,
            options,
        }));
        self.shared.publish_depth();
        self.shared.notify.notify_one();

        debug!(task_id = %id, priority = ?priority, seq = seq, "Task enqueued");
        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> EngineResult<TaskStatus> {
        self.shared
            .tasks
            .get(&id)
            .map(|t| t.clone())
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    /// Unfinished tasks
    pub fn depth(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Forget finished tasks older than the retention window
    pub fn purge_finished(&self) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.shared.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        let before = self.shared.tasks.len();
        self.shared
            .tasks
            .retain(|_, task| !(task.state.is_terminal() && task.updated_at <= cutoff));
        let removed = before.saturating_sub(self.shared.tasks.len());
        if removed > 0 {
            debug!(removed = removed, "Purged finished tasks");
        }
        removed
    }

    /// Stop the workers after their current task
    ///
    /// Items still waiting stay queued and are not run.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.notify.notify_waiters();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Queue worker ended abnormally");
            }
        }
        info!("Request queue stopped");
    }
}

impl Shared {
    fn publish_depth(&self) {
        export::set_queue_depth(self.active.load(Ordering::SeqCst) as f64);
    }

    /// Next ready item, or how long until one might be
    fn take(&self) -> Result<QueueItem, Option<Duration>> {
        let now = Instant::now();
        let mut schedule = self.schedule.lock();
        schedule.promote(now);
        match schedule.ready.pop() {
            Some(Ready(item)) => Ok(item),
            None => Err(schedule.next_wake().map(|at| at.saturating_duration_since(now))),
        }
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut TaskStatus)) {
        if let Some(mut task) = self.tasks.get_mut(&id) {
            apply(&mut task);
            task.updated_at = Utc::now();
        }
    }

    fn finish(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.publish_depth();
    }

    async fn run(&self, mut item: QueueItem) {
        self.update(item.id, |task| {
            task.state = TaskState::Running;
            task.runs += 1;
            task.next_run_at = None;
        });

        let result = self
            .runner
            .run(item.request.clone(), item.options.clone())
            .await;

        match result {
            Ok(completion) => {
                debug!(task_id = %item.id, model = %completion.model, "Task completed");
                self.update(item.id, |task| {
                    task.state = TaskState::Completed;
                    task.error = None;
                    task.result = Some(completion);
                });
                self.finish();
            }
            Err(err) if err.is_retryable() && item.retries < self.config.max_retries => {
                item.retries += 1;
                let mut delay =
                    backoff_delay(self.config.backoff_base, self.config.backoff_max, item.retries);
                if let EngineError::RateLimited { retry_after, .. } = &err {
                    delay = delay.max(*retry_after);
                }
                warn!(
                    task_id = %item.id,
                    retry = item.retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Task failed, scheduling retry"
                );
                let next_run_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d));
                self.update(item.id, |task| {
                    task.state = TaskState::Retrying;
                    task.error = Some(err.to_string());
                    task.next_run_at = next_run_at;
                });
                item.eligible_at = Instant::now() + delay;
                self.schedule.lock().delayed.push(Delayed(item));
                self.notify.notify_one();
            }
            Err(err) => {
                warn!(task_id = %item.id, runs = item.retries + 1, error = %err, "Task failed");
                self.update(item.id, |task| {
                    task.state = TaskState::Failed;
                    task.error = Some(err.to_string());
                });
                self.finish();
            }
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    let mut shutdown = shared.shutdown.subscribe();
    debug!(worker = worker, "Queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        match shared.take() {
            Ok(item) => {
                shared.run(item).await;
            }
            Err(wake_in) => {
                let sleep = wake_in.unwrap_or(Duration::from_secs(3600));
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep(sleep) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    debug!(worker = worker, "Queue worker stopped");
}
