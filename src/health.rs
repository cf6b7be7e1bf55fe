//! Broker health monitor.
//!
//! Owns the process-wide [`HealthState`]. State only changes here: on `connect`, on probe results
//! and on failures reported from the data path. Every transition is published as a
//! [`HealthEvent`] on an unbounded channel that has exactly one consumer (the fallback controller).

use crate::broker::SharedBroker;
use crate::error::{BrokerError, PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Connected,
    Error(String),
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

pub struct HealthMonitor {
    broker: SharedBroker,
    state: RwLock<HealthState>,
    events: mpsc::UnboundedSender<HealthEvent>,
    probe_interval: Duration,
    cancel: CancellationToken,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        broker: SharedBroker,
        probe_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HealthEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(Self {
            broker,
            state: RwLock::new(HealthState::default()),
            events: tx,
            probe_interval,
            cancel: CancellationToken::new(),
            probe: Mutex::new(None),
        });
        (monitor, rx)
    }

    /// Connects the broker and starts background probing. Probing continues after a failed
    /// connect so the monitor notices when the broker comes back.
    pub async fn connect(self: &Arc<Self>) -> PipelineResult<()> {
        let result = self.broker.connect().await;
        match &result {
            Ok(()) => {
                if self.mark_connected() {
                    tracing::info!(broker = self.broker.kind(), "broker connected");
                }
            }
            Err(err) => {
                tracing::warn!(broker = self.broker.kind(), error = %err, "broker connect failed");
                self.record_error(err.to_string());
                self.emit(HealthEvent::Error(err.to_string()));
            }
        }
        self.ensure_probe();
        result.map_err(PipelineError::from)
    }

    pub fn status(&self) -> HealthState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    /// Feeds a broker failure observed outside the probe loop. Only connection-level errors
    /// change state; returns whether a transition happened.
    pub fn report_failure(&self, err: &BrokerError) -> bool {
        if !err.is_connection_error() {
            return false;
        }
        let transitioned = self.mark_disconnected(err.to_string());
        if transitioned {
            tracing::warn!(error = %err, "broker failure reported by data path");
        }
        transitioned
    }

    /// Stops probing, closes the broker and emits `Disconnected`. Terminal.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let handle = self.probe.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.broker.close().await;
        self.update(|state| state.connected = false);
        self.emit(HealthEvent::Disconnected);
        tracing::info!(broker = self.broker.kind(), "broker disconnected");
    }

    fn ensure_probe(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Ok(mut slot) = self.probe.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let monitor = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.probe_interval;
        *slot = Some(tokio::spawn(run_probe(monitor, cancel, period)));
    }

    async fn probe_once(&self) {
        let result = if self.is_connected() {
            self.broker.ping().await
        } else {
            match self.broker.connect().await {
                Ok(()) => self.broker.ping().await,
                Err(err) => Err(err),
            }
        };

        match result {
            Ok(()) => {
                if self.mark_connected() {
                    tracing::info!(broker = self.broker.kind(), "broker reachable again");
                }
            }
            Err(err) => {
                if self.mark_disconnected(err.to_string()) {
                    tracing::warn!(broker = self.broker.kind(), error = %err, "broker probe failed");
                } else {
                    tracing::debug!(error = %err, "broker still unreachable");
                }
            }
        }
    }

    fn mark_connected(&self) -> bool {
        let changed = self.update(|state| {
            let was = state.connected;
            state.connected = true;
            state.last_error = None;
            !was
        });
        if changed {
            self.emit(HealthEvent::Connected);
        }
        changed
    }

    fn mark_disconnected(&self, error: String) -> bool {
        let changed = self.update(|state| {
            let was = state.connected;
            state.connected = false;
            state.last_error = Some(error.clone());
            was
        });
        if changed {
            self.emit(HealthEvent::Error(error));
        }
        changed
    }

    fn record_error(&self, error: String) {
        self.update(|state| {
            state.connected = false;
            state.last_error = Some(error);
        });
    }

    fn update<T>(&self, apply: impl FnOnce(&mut HealthState) -> T) -> T {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.last_checked_at = Some(Utc::now());
        apply(&mut guard)
    }

    fn emit(&self, event: HealthEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("health event receiver dropped");
        }
    }
}

async fn run_probe(monitor: Weak<HealthMonitor>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.probe_once().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<HealthEvent>) -> HealthEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("health event")
            .expect("channel open")
    }

    #[tokio::test]
    async fn connect_emits_connected() {
        let broker = Arc::new(MemoryBroker::new());
        let (monitor, mut rx) = HealthMonitor::new(broker, Duration::from_secs(60));
        assert!(!monitor.status().connected);

        monitor.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, HealthEvent::Connected);
        let status = monitor.status();
        assert!(status.connected);
        assert!(status.last_error.is_none());
        assert!(status.last_checked_at.is_some());
        monitor.disconnect().await;
    }

    #[tokio::test]
    async fn failed_connect_emits_error_and_records_it() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_available(false);
        let (monitor, mut rx) = HealthMonitor::new(broker, Duration::from_secs(60));

        let err = monitor.connect().await.unwrap_err();
        assert!(matches!(err, PipelineError::Connection(_)));
        assert!(matches!(next_event(&mut rx).await, HealthEvent::Error(_)));
        let status = monitor.status();
        assert!(!status.connected);
        assert!(status.last_error.is_some());
        monitor.disconnect().await;
    }

    #[tokio::test]
    async fn probe_tracks_outage_and_recovery() {
        let broker = Arc::new(MemoryBroker::new());
        let (monitor, mut rx) = HealthMonitor::new(broker.clone(), Duration::from_millis(20));
        monitor.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, HealthEvent::Connected);

        broker.set_available(false);
        assert!(matches!(next_event(&mut rx).await, HealthEvent::Error(_)));
        assert!(!monitor.is_connected());

        broker.set_available(true);
        assert_eq!(next_event(&mut rx).await, HealthEvent::Connected);
        assert!(monitor.is_connected());
        monitor.disconnect().await;
    }

    #[tokio::test]
    async fn reported_failures_transition_once() {
        let broker = Arc::new(MemoryBroker::new());
        let (monitor, mut rx) = HealthMonitor::new(broker, Duration::from_secs(60));
        monitor.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, HealthEvent::Connected);

        let err = BrokerError::Unavailable("reset".to_string());
        assert!(monitor.report_failure(&err));
        assert!(!monitor.report_failure(&err));
        assert!(!monitor.report_failure(&BrokerError::Command("WRONGTYPE".to_string())));
        assert!(matches!(next_event(&mut rx).await, HealthEvent::Error(_)));
        assert!(rx.try_recv().is_err());
        monitor.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_stops_probing() {
        let broker = Arc::new(MemoryBroker::new());
        let (monitor, mut rx) = HealthMonitor::new(broker.clone(), Duration::from_millis(10));
        monitor.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, HealthEvent::Connected);

        monitor.disconnect().await;
        assert_eq!(next_event(&mut rx).await, HealthEvent::Disconnected);
        assert!(!monitor.is_connected());

        let before = broker.operations();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.operations(), before);
    }
}
