//! Replays Failed Job Records from spillover back onto their queues.
//!
//! Runs as a periodic background task. A cycle pops at most the depth observed when it starts,
//! oldest first, and resubmits each record straight to its queue (never through the fallback
//! route). Records that cannot be resubmitted go back to the tail. Consecutive cycle-level
//! failures are counted; reaching the limit stops the service until an operator restarts it.

use crate::error::{PipelineError, PipelineResult};
use crate::health::HealthMonitor;
use crate::registry::QueueRegistry;
use crate::spillover::SpilloverStore;
use crate::spool::SpoolStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    pub status: RecoveryStatus,
    pub failed_jobs_count: u64,
    pub dead_letter_count: u64,
    pub is_recovering: bool,
    pub recovery_attempts: u32,
    pub next_recovery_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub exhausted: bool,
    pub local_spillover: Option<SpoolStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    BrokerDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Completed { recovered: u64, requeued: u64 },
}

#[derive(Debug)]
struct RecoveryState {
    status: RecoveryStatus,
    consecutive_failures: u32,
    next_attempt: Option<DateTime<Utc>>,
    last_error: Option<String>,
    exhausted: bool,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

pub struct RecoveryService {
    registry: QueueRegistry,
    spillover: SpilloverStore,
    health: Arc<HealthMonitor>,
    settings: RecoverySettings,
    state: Mutex<RecoveryState>,
    is_recovering: AtomicBool,
    dead_letters: AtomicU64,
}

/// Clears the in-flight flag when a cycle ends, including on early return.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RecoveryService {
    pub fn new(
        registry: QueueRegistry,
        spillover: SpilloverStore,
        health: Arc<HealthMonitor>,
        settings: RecoverySettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            spillover,
            health,
            settings,
            state: Mutex::new(RecoveryState {
                status: RecoveryStatus::Stopped,
                consecutive_failures: 0,
                next_attempt: None,
                last_error: None,
                exhausted: false,
                cancel: None,
                task: None,
            }),
            is_recovering: AtomicBool::new(false),
            dead_letters: AtomicU64::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, RecoveryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> RecoveryStatus {
        self.state().status
    }

    /// Returns false when already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut state = self.state();
        if state.status == RecoveryStatus::Running {
            return false;
        }
        let cancel = CancellationToken::new();
        state.status = RecoveryStatus::Running;
        state.consecutive_failures = 0;
        state.exhausted = false;
        state.next_attempt = Some(Utc::now() + self.interval_delta());
        state.cancel = Some(cancel.clone());

        let service = Arc::downgrade(self);
        let period = self.settings.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(service) = service.upgrade() else {
                            break;
                        };
                        service.scheduled_cycle(&cancel).await;
                    }
                }
            }
        });
        state.task = Some(task);
        drop(state);

        tracing::info!(
            interval_ms = period.as_millis() as u64,
            max_attempts = self.settings.max_attempts,
            "recovery service started"
        );
        true
    }

    /// Returns false when already stopped.
    pub fn stop(&self) -> bool {
        let mut state = self.state();
        let was_running = state.status == RecoveryStatus::Running;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.status = RecoveryStatus::Stopped;
        // A halted service keeps its count until the next start.
        if !state.exhausted {
            state.consecutive_failures = 0;
        }
        state.next_attempt = None;
        if was_running {
            tracing::info!("recovery service stopped");
        }
        was_running
    }

    /// Stops the service and waits up to `grace` for an in-flight cycle to finish, so a record
    /// popped from spillover is resubmitted or pushed back before the broker closes.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop();
        let task = self.state().task.take();
        let Some(task) = task else {
            return;
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "recovery task failed"),
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "recovery cycle still running after grace; aborting"
                );
                abort.abort();
            }
        }
    }

    /// Runs one cycle immediately, independent of the timer.
    pub async fn run_cycle_now(&self) -> PipelineResult<CycleOutcome> {
        let result = self.run_cycle().await;
        self.account(&result);
        result
    }

    async fn scheduled_cycle(&self, cancel: &CancellationToken) {
        {
            let mut state = self.state();
            state.next_attempt = Some(Utc::now() + self.interval_delta());
        }
        let result = self.run_cycle().await;
        if cancel.is_cancelled() {
            return;
        }
        self.account(&result);
    }

    fn account(&self, result: &PipelineResult<CycleOutcome>) {
        let mut state = self.state();
        match result {
            Ok(CycleOutcome::Completed { requeued: 0, .. }) => {
                state.consecutive_failures = 0;
                state.last_error = None;
            }
            Ok(_) => {}
            Err(err) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_error = Some(err.to_string());
                tracing::warn!(
                    error = %err,
                    consecutive_failures = state.consecutive_failures,
                    "recovery cycle failed"
                );
                if state.consecutive_failures >= self.settings.max_attempts
                    && state.status == RecoveryStatus::Running
                {
                    if let Some(cancel) = state.cancel.take() {
                        cancel.cancel();
                    }
                    state.status = RecoveryStatus::Stopped;
                    state.next_attempt = None;
                    state.exhausted = true;
                    let fatal = PipelineError::RecoveryExhausted {
                        attempts: state.consecutive_failures,
                        last_error: err.to_string(),
                    };
                    tracing::error!(error = %fatal, "recovery service halted; operator action required");
                }
            }
        }
    }

    async fn run_cycle(&self) -> PipelineResult<CycleOutcome> {
        if self
            .is_recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("recovery cycle already in progress; skipping");
            return Ok(CycleOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = CycleGuard(&self.is_recovering);

        if !self.health.is_connected() {
            tracing::debug!("broker disconnected; deferring recovery cycle");
            return Ok(CycleOutcome::Skipped(SkipReason::BrokerDisconnected));
        }

        let depth = self.spillover.len().await?;
        let mut recovered = 0u64;
        let mut requeued = 0u64;
        for _ in 0..depth {
            let Some(record) = self.spillover.pop().await? else {
                break;
            };
            match self.registry.resubmit(&record).await {
                Ok(_) => recovered += 1,
                Err(err) => {
                    if let PipelineError::Connection(broker_err) = &err {
                        self.health.report_failure(broker_err);
                    }
                    tracing::warn!(
                        job_id = %record.id,
                        queue = %record.queue_name,
                        error = %err,
                        "resubmit failed; returning record to spillover"
                    );
                    self.spillover.push(&record).await?;
                    requeued += 1;
                    if matches!(err, PipelineError::Shutdown) {
                        return Err(err);
                    }
                }
            }
        }

        if let Ok(count) = self.spillover.dead_letter_len().await {
            self.dead_letters.store(count, Ordering::Relaxed);
        }
        if depth > 0 {
            tracing::info!(depth, recovered, requeued, "recovery cycle finished");
        }
        Ok(CycleOutcome::Completed {
            recovered,
            requeued,
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.state().exhausted
    }

    /// The fatal condition, if the service halted itself.
    pub fn exhausted_error(&self) -> Option<PipelineError> {
        let state = self.state();
        state.exhausted.then(|| PipelineError::RecoveryExhausted {
            attempts: state.consecutive_failures,
            last_error: state.last_error.clone().unwrap_or_default(),
        })
    }

    pub async fn stats(&self) -> RecoveryStats {
        let (failed_jobs_count, dead_letter_count) = if self.health.is_connected() {
            let depth = self.spillover.depth_or_last_known().await;
            if let Ok(count) = self.spillover.dead_letter_len().await {
                self.dead_letters.store(count, Ordering::Relaxed);
            }
            (depth, self.dead_letters.load(Ordering::Relaxed))
        } else {
            (
                self.spillover.last_known_depth(),
                self.dead_letters.load(Ordering::Relaxed),
            )
        };

        let local_spillover = self.spillover.local_status().await;

        let state = self.state();
        RecoveryStats {
            status: state.status,
            failed_jobs_count,
            dead_letter_count,
            is_recovering: self.is_recovering.load(Ordering::Acquire),
            recovery_attempts: state.consecutive_failures,
            next_recovery_attempt: state.next_attempt,
            last_error: state.last_error.clone(),
            exhausted: state.exhausted,
            local_spillover,
        }
    }

    fn interval_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.interval).unwrap_or(chrono::Duration::zero())
    }
}
