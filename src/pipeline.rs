//! `QueuePipeline`: the coordinating object that owns every pipeline component and exposes the
//! ingestion API used by request handlers.

use crate::broker::{MemoryBroker, QueueKeys, RedisBroker, SharedBroker};
use crate::codec::Codec;
use crate::config::{BrokerKind, Config};
use crate::error::{PipelineError, PipelineResult};
use crate::fallback::FallbackController;
use crate::health::{HealthMonitor, HealthState};
use crate::job::{Category, EnqueueReceipt};
use crate::processor::ProcessorTable;
use crate::recovery::{RecoveryService, RecoverySettings, RecoveryStats};
use crate::registry::{QueueHandle, QueueMetrics, QueueRegistry, QueueSettings, RegistryContext};
use crate::spillover::SpilloverStore;
use crate::spool::{spawn_spool_thread, SpoolHandle};
use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queues: BTreeMap<String, QueueMetrics>,
    pub redis: HealthState,
    pub fallback_mode: bool,
}

/// Everything needed to assemble a pipeline without reading the environment.
pub struct PipelineParts {
    pub broker: SharedBroker,
    pub keys: QueueKeys,
    pub codec: Codec,
    pub processors: ProcessorTable,
    pub queue_settings: QueueSettings,
    pub recovery_settings: RecoverySettings,
    pub probe_interval: Duration,
    pub local_spool: Option<SpoolHandle>,
}

impl PipelineParts {
    /// In-process broker with default settings.
    pub fn in_memory(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            keys: QueueKeys::default(),
            codec: Codec::default(),
            processors: ProcessorTable::default(),
            queue_settings: QueueSettings::default(),
            recovery_settings: RecoverySettings::default(),
            probe_interval: crate::health::DEFAULT_PROBE_INTERVAL,
            local_spool: None,
        }
    }
}

pub struct QueuePipeline {
    health: Arc<HealthMonitor>,
    fallback: Arc<FallbackController>,
    spillover: SpilloverStore,
    registry: QueueRegistry,
    recovery: Arc<RecoveryService>,
    background: CancellationToken,
    fallback_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl QueuePipeline {
    /// Must be called inside a Tokio runtime: the fallback controller task starts here.
    pub fn build(parts: PipelineParts) -> Self {
        let (health, events) = HealthMonitor::new(parts.broker.clone(), parts.probe_interval);
        let fallback = Arc::new(FallbackController::new());
        let background = CancellationToken::new();
        let fallback_task = fallback.spawn(events, background.child_token());

        let spillover =
            SpilloverStore::new(parts.broker.clone(), parts.keys.clone(), parts.local_spool);
        let registry = QueueRegistry::new(
            RegistryContext {
                broker: parts.broker,
                keys: parts.keys,
                codec: parts.codec,
                health: health.clone(),
                fallback: fallback.clone(),
                spillover: spillover.clone(),
                processors: parts.processors,
            },
            parts.queue_settings,
        );
        let recovery = RecoveryService::new(
            registry.clone(),
            spillover.clone(),
            health.clone(),
            parts.recovery_settings,
        );

        Self {
            health,
            fallback,
            spillover,
            registry,
            recovery,
            background,
            fallback_task: Mutex::new(Some(fallback_task)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let broker: SharedBroker = match config.broker {
            BrokerKind::Redis => Arc::new(
                RedisBroker::new(&config.redis_url()?, config.operation_timeout)
                    .context("failed to configure redis broker")?,
            ),
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        };

        let local_spool = match &config.spillover_local_dir {
            Some(dir) => Some(
                spawn_spool_thread(dir.clone())
                    .with_context(|| format!("failed to open local spillover at {}", dir.display()))?,
            ),
            None => {
                tracing::warn!("local spillover disabled; a broker outage can drop failed jobs");
                None
            }
        };

        let processors =
            ProcessorTable::from_config(config).context("failed to configure processors")?;

        Ok(Self::build(PipelineParts {
            broker,
            keys: config.queue_keys(),
            codec: Codec::new(config.codec_config()),
            processors,
            queue_settings: config.queue_settings(),
            recovery_settings: config.recovery_settings(),
            probe_interval: config.probe_interval,
            local_spool,
        }))
    }

    /// Connects the broker. On failure the pipeline keeps running in fallback mode and the
    /// health probe keeps retrying.
    pub async fn connect(&self) -> PipelineResult<()> {
        self.health.connect().await
    }

    pub fn create_queue(&self, category: Category) -> PipelineResult<QueueHandle> {
        self.registry.create_queue(category)
    }

    pub fn create_queues(&self) -> PipelineResult<Vec<QueueHandle>> {
        Category::ALL
            .into_iter()
            .map(|category| self.create_queue(category))
            .collect()
    }

    pub async fn add_sensor_data(&self, data: Value) -> PipelineResult<EnqueueReceipt> {
        self.enqueue(Category::SensorData, data).await
    }

    pub async fn add_analytics(&self, data: Value) -> PipelineResult<EnqueueReceipt> {
        self.enqueue(Category::Analytics, data).await
    }

    pub async fn add_alert(&self, data: Value) -> PipelineResult<EnqueueReceipt> {
        self.enqueue(Category::Alerts, data).await
    }

    /// Accepts any JSON object. Only validation failures and shutdown are returned as errors;
    /// broker trouble routes the job to spillover instead.
    pub async fn enqueue(&self, category: Category, data: Value) -> PipelineResult<EnqueueReceipt> {
        if !data.is_object() {
            return Err(PipelineError::Validation(format!(
                "{category} payload must be a JSON object"
            )));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Shutdown);
        }
        self.registry.enqueue(category, data).await
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        QueueStats {
            queues: self.registry.all_metrics().await,
            redis: self.health.status(),
            fallback_mode: self.fallback.is_active(),
        }
    }

    pub async fn get_recovery_stats(&self) -> RecoveryStats {
        self.recovery.stats().await
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn fallback(&self) -> &Arc<FallbackController> {
        &self.fallback
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn spillover(&self) -> &SpilloverStore {
        &self.spillover
    }

    /// Shuts everything down in dependency order. Every step runs even if an earlier one fails;
    /// the first failure is returned. Safe to call more than once.
    pub async fn clean_up(&self) -> PipelineResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_error: Option<PipelineError> = None;

        let grace = self.registry.settings().shutdown_grace;
        self.recovery.shutdown(grace).await;
        self.registry.close(grace).await;

        self.background.cancel();
        let task = self.fallback_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "fallback controller task failed");
                first_error.get_or_insert(PipelineError::Processing(format!(
                    "fallback controller task: {err}"
                )));
            }
        }

        self.health.disconnect().await;

        match first_error {
            Some(err) => Err(err),
            None => {
                tracing::info!("queue pipeline shut down");
                Ok(())
            }
        }
    }
}
