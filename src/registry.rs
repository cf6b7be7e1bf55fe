//! Queue registry and per-category worker pools.
//!
//! Each category owns one broker list (`<prefix>:<queue>:waiting`) and a fixed number of worker
//! tasks popping from its head. A worker makes a single pass over each job: it decodes the stored
//! payload, hands it to the category processor (with a bounded in-place retry) and then either
//! counts it completed or writes exactly one Failed Job Record to spillover.

use crate::broker::{QueueKeys, SharedBroker};
use crate::codec::Codec;
use crate::error::{PipelineError, PipelineResult};
use crate::fallback::FallbackController;
use crate::health::HealthMonitor;
use crate::job::{Category, EnqueueReceipt, EnqueueRoute, FailedJobRecord, Job, JobId};
use crate::processor::ProcessorTable;
use crate::spillover::SpilloverStore;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub sensor_data_concurrency: usize,
    pub analytics_concurrency: usize,
    pub alerts_concurrency: usize,
    pub max_attempts: u32,
    /// Replays from spillover before a job that keeps failing is dead-lettered.
    pub max_replays: u32,
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl QueueSettings {
    pub fn concurrency(&self, category: Category) -> usize {
        let configured = match category {
            Category::SensorData => self.sensor_data_concurrency,
            Category::Analytics => self.analytics_concurrency,
            Category::Alerts => self.alerts_concurrency,
        };
        configured.max(1)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            sensor_data_concurrency: 5,
            analytics_concurrency: 2,
            alerts_concurrency: 3,
            max_attempts: 3,
            max_replays: 5,
            backoff_base: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    waiting: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    delayed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

struct QueueInner {
    category: Category,
    key: String,
    concurrency: usize,
    counters: QueueCounters,
    notify: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to one category queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct QueueHandle {
    inner: Arc<QueueInner>,
}

impl QueueHandle {
    pub fn category(&self) -> Category {
        self.inner.category
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn worker_count(&self) -> usize {
        self.inner
            .workers
            .lock()
            .map(|workers| workers.len())
            .unwrap_or(0)
    }

    pub fn same_as(&self, other: &QueueHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn counters(&self) -> &QueueCounters {
        &self.inner.counters
    }
}

/// Collaborators the registry routes jobs through.
#[derive(Clone)]
pub struct RegistryContext {
    pub broker: SharedBroker,
    pub keys: QueueKeys,
    pub codec: Codec,
    pub health: Arc<HealthMonitor>,
    pub fallback: Arc<FallbackController>,
    pub spillover: SpilloverStore,
    pub processors: ProcessorTable,
}

struct RegistryInner {
    ctx: RegistryContext,
    settings: QueueSettings,
    queues: Mutex<HashMap<Category, QueueHandle>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct QueueRegistry {
    inner: Arc<RegistryInner>,
}

impl QueueRegistry {
    pub fn new(ctx: RegistryContext, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                settings,
                queues: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Returns the queue for `category`, starting its worker pool on first use.
    pub fn create_queue(&self, category: Category) -> PipelineResult<QueueHandle> {
        if self.inner.cancel.is_cancelled() {
            return Err(PipelineError::Shutdown);
        }
        let mut queues = self
            .inner
            .queues
            .lock()
            .map_err(|_| PipelineError::Processing("queue registry lock poisoned".to_string()))?;
        if let Some(existing) = queues.get(&category) {
            return Ok(existing.clone());
        }

        let concurrency = self.inner.settings.concurrency(category);
        let handle = QueueHandle {
            inner: Arc::new(QueueInner {
                category,
                key: self.inner.ctx.keys.waiting(category),
                concurrency,
                counters: QueueCounters::default(),
                notify: Notify::new(),
                workers: Mutex::new(Vec::with_capacity(concurrency)),
            }),
        };

        let workers: Vec<JoinHandle<()>> = (0..concurrency)
            .map(|slot| {
                tokio::spawn(run_worker(
                    self.inner.clone(),
                    handle.clone(),
                    slot,
                    self.inner.cancel.child_token(),
                ))
            })
            .collect();
        if let Ok(mut slots) = handle.inner.workers.lock() {
            *slots = workers;
        }

        tracing::info!(queue = %category, key = %handle.key(), concurrency, "queue created");
        queues.insert(category, handle.clone());
        Ok(handle)
    }

    pub fn queue(&self, category: Category) -> Option<QueueHandle> {
        self.inner
            .queues
            .lock()
            .ok()
            .and_then(|queues| queues.get(&category).cloned())
    }

    /// Normal path: compress and push to the category queue. Degraded path (fallback active or
    /// the push fails on a connection error): write a Failed Job Record to spillover. A command
    /// error from a reachable broker is returned to the caller.
    pub async fn enqueue(&self, category: Category, payload: Value) -> PipelineResult<EnqueueReceipt> {
        let ctx = &self.inner.ctx;
        if ctx.fallback.is_active() {
            return self
                .spill(Uuid::new_v4(), category, payload, "fallback mode active")
                .await;
        }

        match self.submit(category, &payload).await {
            Ok(id) => Ok(EnqueueReceipt {
                id,
                route: EnqueueRoute::Queued,
            }),
            Err(PipelineError::Connection(err)) => {
                ctx.health.report_failure(&err);
                tracing::warn!(queue = %category, error = %err, "enqueue failed; spilling job");
                self.spill(Uuid::new_v4(), category, payload, &err.to_string())
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Pushes straight to the queue without consulting fallback mode. Errors are returned to the
    /// caller; recovery relies on this to avoid requeue loops.
    pub async fn submit(&self, category: Category, payload: &Value) -> PipelineResult<JobId> {
        self.push_job(category, payload, None).await
    }

    /// Replays a Failed Job Record onto its queue under its original id, keeping its attempt
    /// history and counting one more replay.
    pub async fn resubmit(&self, record: &FailedJobRecord) -> PipelineResult<JobId> {
        self.push_job(record.queue_name, &record.payload, Some(record))
            .await
    }

    async fn push_job(
        &self,
        category: Category,
        payload: &Value,
        replayed: Option<&FailedJobRecord>,
    ) -> PipelineResult<JobId> {
        let queue = self.create_queue(category)?;
        let ctx = &self.inner.ctx;
        let mut job = Job::new(category, ctx.codec.compress(payload)?);
        if let Some(record) = replayed {
            job.id = record.id;
            job.attempts = record.attempts;
            job.replays = record.replays.saturating_add(1);
        }
        let encoded = serde_json::to_string(&job)
            .map_err(|err| PipelineError::Codec(format!("encode job: {err}")))?;

        ctx.broker.push_back(queue.key(), encoded).await?;
        queue.counters().waiting.fetch_add(1, Ordering::Relaxed);
        queue.inner.notify.notify_one();
        tracing::trace!(queue = %category, job_id = %job.id, compressed = job.compressed(), "job queued");
        Ok(job.id)
    }

    async fn spill(
        &self,
        id: JobId,
        category: Category,
        payload: Value,
        reason: &str,
    ) -> PipelineResult<EnqueueReceipt> {
        let record = FailedJobRecord::new(id, category, payload, reason);
        self.inner.ctx.spillover.push(&record).await?;
        Ok(EnqueueReceipt {
            id,
            route: EnqueueRoute::Spilled,
        })
    }

    /// Snapshot of one queue's counters. `waiting` is read from the broker when it is reachable
    /// and falls back to the last observed depth otherwise.
    pub async fn metrics(&self, category: Category) -> QueueMetrics {
        let Some(queue) = self.queue(category) else {
            return QueueMetrics::default();
        };
        let counters = queue.counters();
        let ctx = &self.inner.ctx;
        if ctx.health.is_connected() {
            match ctx.broker.len(queue.key()).await {
                Ok(depth) => counters.waiting.store(depth, Ordering::Relaxed),
                Err(err) => {
                    tracing::debug!(queue = %category, error = %err, "queue depth unavailable");
                }
            }
        }
        QueueMetrics {
            waiting: counters.waiting.load(Ordering::Relaxed),
            active: counters.active.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            delayed: counters.delayed.load(Ordering::Relaxed),
        }
    }

    pub async fn all_metrics(&self) -> BTreeMap<String, QueueMetrics> {
        let mut out = BTreeMap::new();
        for category in Category::ALL {
            out.insert(category.queue_name().to_string(), self.metrics(category).await);
        }
        out
    }

    /// Stops every worker pool. Workers finish their current job within `grace`; stragglers
    /// are aborted.
    pub async fn close(&self, grace: Duration) {
        self.inner.cancel.cancel();
        let queues: Vec<QueueHandle> = self
            .inner
            .queues
            .lock()
            .map(|queues| queues.values().cloned().collect())
            .unwrap_or_default();

        let mut handles = Vec::new();
        for queue in &queues {
            queue.inner.notify.notify_waiters();
            if let Ok(mut workers) = queue.inner.workers.lock() {
                handles.append(&mut workers);
            }
        }
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        let total = handles.len();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(workers = total, grace_ms = grace.as_millis() as u64, "worker drain timed out; aborting");
            for abort in aborts {
                abort.abort();
            }
        } else {
            tracing::info!(workers = total, "worker pools drained");
        }
    }
}

async fn run_worker(
    registry: Arc<RegistryInner>,
    queue: QueueHandle,
    slot: usize,
    cancel: CancellationToken,
) {
    let ctx = &registry.ctx;
    let poll = registry.settings.poll_interval;
    tracing::debug!(queue = %queue.category(), slot, "worker started");

    while !cancel.is_cancelled() {
        match ctx.broker.pop_front(queue.key()).await {
            Ok(Some(raw)) => {
                let counters = queue.counters();
                let _ = counters
                    .waiting
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                        Some(v.saturating_sub(1))
                    });
                counters.active.fetch_add(1, Ordering::Relaxed);
                process_raw(&registry, &queue, raw, &cancel).await;
                counters.active.fetch_sub(1, Ordering::Relaxed);
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.inner.notify.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            Err(err) => {
                ctx.health.report_failure(&err);
                tracing::debug!(queue = %queue.category(), slot, error = %err, "worker pop failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }
    tracing::debug!(queue = %queue.category(), slot, "worker stopped");
}

async fn process_raw(
    registry: &RegistryInner,
    queue: &QueueHandle,
    raw: String,
    cancel: &CancellationToken,
) {
    let ctx = &registry.ctx;
    let counters = queue.counters();
    let category = queue.category();

    let job: Job = match serde_json::from_str(&raw) {
        Ok(job) => job,
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            ctx.spillover
                .dead_letter(json!({
                    "id": Value::Null,
                    "queue_name": category,
                    "raw": raw,
                    "error_message": format!("undecodable job: {err}"),
                    "failed_at": Utc::now(),
                }))
                .await;
            return;
        }
    };

    // Corrupt bytes are never retried.
    let payload = match ctx.codec.decompress(&job.payload) {
        Ok(payload) => payload,
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(queue = %category, job_id = %job.id, error = %err, "job payload corrupt");
            ctx.spillover
                .dead_letter(json!({
                    "id": job.id,
                    "queue_name": category,
                    "payload": job.payload,
                    "error_message": err.to_string(),
                    "failed_at": Utc::now(),
                }))
                .await;
            return;
        }
    };

    let processor = ctx.processors.get(category);
    let max_attempts = registry.settings.max_attempts.max(1);
    // `pass` bounds this run; `attempt` is the total across replays.
    let mut pass = 0u32;
    let mut attempt = job.attempts;
    loop {
        pass += 1;
        attempt = attempt.saturating_add(1);
        let err = match processor.process(category, &payload).await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(queue = %category, job_id = %job.id, attempt, "job completed");
                return;
            }
            Err(err) => err,
        };

        if pass >= max_attempts || !err.is_transient() {
            record_failure(registry, queue, &job, attempt, payload, &err).await;
            return;
        }

        let delay = registry.settings.backoff(pass);
        tracing::debug!(
            queue = %category,
            job_id = %job.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            processor = processor.name(),
            "job failed; retrying"
        );
        counters.active.fetch_sub(1, Ordering::Relaxed);
        counters.delayed.fetch_add(1, Ordering::Relaxed);
        let interrupted = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        counters.delayed.fetch_sub(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);

        if interrupted {
            record_failure(registry, queue, &job, attempt, payload, &PipelineError::Shutdown).await;
            return;
        }
    }
}

/// Writes the failed job back to spillover, or to the dead-letter list once it has used up its
/// replays. A job interrupted by shutdown always goes back to spillover.
async fn record_failure(
    registry: &RegistryInner,
    queue: &QueueHandle,
    job: &Job,
    attempts: u32,
    payload: Value,
    err: &PipelineError,
) {
    let category = queue.category();
    queue.counters().failed.fetch_add(1, Ordering::Relaxed);

    let interrupted = matches!(err, PipelineError::Shutdown);
    if !interrupted && job.replays >= registry.settings.max_replays {
        tracing::error!(
            queue = %category,
            job_id = %job.id,
            attempts,
            replays = job.replays,
            error = %err,
            "job keeps failing; moving to dead letter"
        );
        registry
            .ctx
            .spillover
            .dead_letter(json!({
                "id": job.id,
                "queue_name": category,
                "payload": payload,
                "attempts": attempts,
                "replays": job.replays,
                "error_message": format!("replay limit reached: {err}"),
                "failed_at": Utc::now(),
            }))
            .await;
        return;
    }

    tracing::warn!(queue = %category, job_id = %job.id, attempts, error = %err, "job failed; recording for recovery");
    let record = FailedJobRecord::new(job.id, category, payload, err.to_string())
        .with_history(attempts, job.replays);
    // Push errors are logged inside the store.
    let _ = registry.ctx.spillover.push(&record).await;
}
