#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_queue::broker::MemoryBroker;
use telemetry_queue::error::PipelineError;
use telemetry_queue::job::Category;
use telemetry_queue::pipeline::{PipelineParts, QueuePipeline};
use telemetry_queue::processor::{JobProcessor, ProcessorTable};
use telemetry_queue::recovery::RecoverySettings;
use telemetry_queue::registry::{QueueMetrics, QueueSettings};
use tokio::sync::Semaphore;

/// Processor that records payloads and, when gated, holds each job until a permit is added.
pub struct Recorder {
    gate: Option<Semaphore>,
    seen: Mutex<Vec<(Category, Value)>>,
}

impl Recorder {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            gate: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn release(&self, jobs: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(jobs);
        }
    }

    pub fn seen(&self) -> Vec<(Category, Value)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobProcessor for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn process(&self, category: Category, payload: &Value) -> Result<(), PipelineError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| PipelineError::Shutdown)?
                .forget();
        }
        self.seen.lock().unwrap().push((category, payload.clone()));
        Ok(())
    }
}

pub fn fast_queue_settings() -> QueueSettings {
    QueueSettings {
        sensor_data_concurrency: 1,
        analytics_concurrency: 1,
        alerts_concurrency: 1,
        max_attempts: 2,
        max_replays: 5,
        backoff_base: Duration::from_millis(5),
        poll_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(1),
    }
}

pub fn parts(broker: Arc<MemoryBroker>, processor: Arc<dyn JobProcessor>) -> PipelineParts {
    PipelineParts {
        processors: ProcessorTable::uniform(processor),
        queue_settings: fast_queue_settings(),
        recovery_settings: RecoverySettings {
            interval: Duration::from_secs(60),
            max_attempts: 10,
        },
        probe_interval: Duration::from_millis(20),
        ..PipelineParts::in_memory(broker)
    }
}

pub async fn connected_pipeline(
    processor: Arc<dyn JobProcessor>,
) -> (Arc<MemoryBroker>, QueuePipeline) {
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = QueuePipeline::build(parts(broker.clone(), processor));
    pipeline.connect().await.unwrap();
    (broker, pipeline)
}

pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_metrics(
    pipeline: &QueuePipeline,
    category: Category,
    done: impl Fn(&QueueMetrics) -> bool,
) -> QueueMetrics {
    for _ in 0..300 {
        let metrics = pipeline.registry().metrics(category).await;
        if done(&metrics) {
            return metrics;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{category} metrics never settled");
}
