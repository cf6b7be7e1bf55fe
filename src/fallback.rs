use crate::health::HealthEvent;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Degraded-mode switch consulted by every enqueue.
///
/// Latched: it flips only on `Error` / `Connected` health events, and repeated events of the same
/// kind are no-ops.
#[derive(Debug, Default)]
pub struct FallbackController {
    active: AtomicBool,
    activations: AtomicU64,
}

impl FallbackController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of times fallback mode has been entered since startup.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    pub fn activate(&self, reason: &str) -> bool {
        if self.active.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.activations.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(reason, "fallback mode enabled; new jobs go to spillover");
        true
    }

    pub fn deactivate(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        tracing::info!("fallback mode disabled; resuming normal enqueue");
        true
    }

    pub fn apply(&self, event: &HealthEvent) -> bool {
        match event {
            HealthEvent::Error(reason) => self.activate(reason),
            HealthEvent::Connected => self.deactivate(),
            HealthEvent::Disconnected => false,
        }
    }

    /// Single consumer of the health monitor's transition events.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<HealthEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        tracing::debug!(?event, "health event");
                        controller.apply(&event);
                    }
                }
            }
        })
    }
}
