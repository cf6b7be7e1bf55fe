mod common;

use async_trait::async_trait;
use common::{connected_pipeline, eventually, fast_queue_settings, parts, wait_for_metrics, Recorder};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use telemetry_queue::broker::{Broker, MemoryBroker, QueueKeys};
use telemetry_queue::error::{BrokerError, PipelineError};
use telemetry_queue::job::{Category, EnqueueRoute, FailedJobRecord};
use telemetry_queue::processor::{JobProcessor, ProcessorTable};
use telemetry_queue::pipeline::{PipelineParts, QueuePipeline};
use telemetry_queue::recovery::{CycleOutcome, RecoverySettings, RecoveryStatus};
use telemetry_queue::spool::spawn_spool_thread;
use tempfile::TempDir;
use uuid::Uuid;

#[tokio::test]
async fn alert_is_counted_waiting_then_completed() {
    let recorder = Recorder::gated();
    let (_broker, pipeline) = connected_pipeline(recorder.clone()).await;

    // Occupy the single alerts worker so the next job stays waiting.
    pipeline
        .add_alert(json!({"deviceId": "SNS-0001", "severity": "info"}))
        .await
        .unwrap();
    wait_for_metrics(&pipeline, Category::Alerts, |m| m.active == 1).await;
    let before = pipeline.get_queue_stats().await.queues["alerts"];

    let receipt = pipeline
        .add_alert(json!({"deviceId": "SNS-1001", "severity": "critical"}))
        .await
        .unwrap();
    assert_eq!(receipt.route, EnqueueRoute::Queued);
    let queued = pipeline.get_queue_stats().await.queues["alerts"];
    assert_eq!(queued.waiting, before.waiting + 1);

    recorder.release(2);
    let done = wait_for_metrics(&pipeline, Category::Alerts, |m| {
        m.completed == before.completed + 2
    })
    .await;
    assert_eq!(done.waiting, before.waiting);
    assert_eq!(
        recorder.seen().last().map(|(_, payload)| payload.clone()),
        Some(json!({"deviceId": "SNS-1001", "severity": "critical"}))
    );
    pipeline.clean_up().await.unwrap();
}

#[tokio::test]
async fn forced_fallback_routes_alert_to_spillover() {
    let (broker, pipeline) = connected_pipeline(Recorder::open()).await;
    let keys = QueueKeys::default();
    let before = pipeline.get_recovery_stats().await.failed_jobs_count;

    pipeline.fallback().activate("forced by test");
    let receipt = pipeline
        .add_alert(json!({"deviceId": "SNS-1001", "severity": "critical"}))
        .await
        .unwrap();

    assert_eq!(receipt.route, EnqueueRoute::Spilled);
    assert_eq!(
        pipeline.get_recovery_stats().await.failed_jobs_count,
        before + 1
    );
    let stats = pipeline.get_queue_stats().await;
    assert!(stats.fallback_mode);
    assert_eq!(stats.queues["alerts"].waiting, 0);
    assert!(broker.snapshot(&keys.waiting(Category::Alerts)).is_empty());
    pipeline.clean_up().await.unwrap();
}

#[tokio::test]
async fn outage_loses_no_jobs_after_recovery_cycle() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::open();
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = QueuePipeline::build(PipelineParts {
        local_spool: Some(spawn_spool_thread(dir.path().to_path_buf()).unwrap()),
        ..parts(broker.clone(), recorder.clone())
    });
    pipeline.connect().await.unwrap();
    pipeline.create_queues().unwrap();

    broker.set_available(false);
    eventually("fallback mode", || pipeline.fallback().is_active()).await;

    const N: usize = 12;
    for n in 0..N {
        let receipt = pipeline
            .add_sensor_data(json!({"sensorId": "SNS-7", "seq": n}))
            .await
            .unwrap();
        assert_eq!(receipt.route, EnqueueRoute::Spilled);
    }
    assert_eq!(
        pipeline.get_recovery_stats().await.failed_jobs_count,
        N as u64
    );

    broker.set_available(true);
    eventually("broker reconnect", || {
        pipeline.health().is_connected() && !pipeline.fallback().is_active()
    })
    .await;

    let outcome = pipeline.recovery().run_cycle_now().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            recovered: N as u64,
            requeued: 0
        }
    );
    assert_eq!(pipeline.get_recovery_stats().await.failed_jobs_count, 0);

    wait_for_metrics(&pipeline, Category::SensorData, |m| {
        m.completed == N as u64
    })
    .await;
    let seqs: Vec<u64> = recorder
        .seen()
        .iter()
        .filter_map(|(_, payload)| payload["seq"].as_u64())
        .collect();
    assert_eq!(seqs, (0..N as u64).collect::<Vec<_>>());
    assert_eq!(pipeline.fallback().activations(), 1);
    pipeline.clean_up().await.unwrap();
}

#[tokio::test]
async fn queue_creation_is_idempotent() {
    let (_broker, pipeline) = connected_pipeline(Recorder::open()).await;
    let first = pipeline.create_queue(Category::SensorData).unwrap();
    let second = pipeline.create_queue(Category::SensorData).unwrap();
    assert!(first.same_as(&second));
    assert_eq!(second.worker_count(), first.concurrency());

    let all = pipeline.create_queues().unwrap();
    assert!(all[0].same_as(&first));
    pipeline.clean_up().await.unwrap();
}

#[tokio::test]
async fn recovery_halts_after_max_consecutive_failures() {
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = QueuePipeline::build(PipelineParts {
        recovery_settings: RecoverySettings {
            interval: Duration::from_millis(5),
            max_attempts: 10,
        },
        ..parts(broker.clone(), Recorder::open())
    });
    pipeline.connect().await.unwrap();
    broker.fail_key(&QueueKeys::default().failed_jobs, true);

    pipeline.recovery().start();
    eventually("recovery to stop", || {
        pipeline.recovery().status() == RecoveryStatus::Stopped
    })
    .await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let stats = pipeline.get_recovery_stats().await;
    assert_eq!(stats.status, RecoveryStatus::Stopped);
    assert_eq!(stats.recovery_attempts, 10);
    assert!(stats.exhausted);
    assert!(stats.last_error.is_some());
    pipeline.clean_up().await.unwrap();
}

#[tokio::test]
async fn enqueue_during_unnoticed_outage_still_spills() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = QueuePipeline::build(PipelineParts {
        local_spool: Some(spawn_spool_thread(dir.path().to_path_buf()).unwrap()),
        probe_interval: Duration::from_secs(60),
        ..parts(broker.clone(), Recorder::open())
    });
    pipeline.connect().await.unwrap();
    assert!(!pipeline.fallback().is_active());

    broker.set_available(false);
    let receipt = pipeline
        .add_analytics(json!({"kind": "rollup", "window": "1h"}))
        .await
        .unwrap();
    assert_eq!(receipt.route, EnqueueRoute::Spilled);
    assert!(!pipeline.health().is_connected());
    eventually("fallback mode", || pipeline.fallback().is_active()).await;
    assert_eq!(pipeline.spillover().last_known_depth(), 1);
    pipeline.clean_up().await.unwrap();
}

/// Memory broker whose pops on one key take a while.
struct SlowPop {
    inner: Arc<MemoryBroker>,
    key: String,
    delay: Duration,
}

#[async_trait]
impl Broker for SlowPop {
    fn kind(&self) -> &'static str {
        "slow-pop"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        self.inner.connect().await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    async fn push_back(&self, key: &str, value: String) -> Result<(), BrokerError> {
        self.inner.push_back(key, value).await
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, BrokerError> {
        if key == self.key {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.pop_front(key).await
    }

    async fn len(&self, key: &str) -> Result<u64, BrokerError> {
        self.inner.len(key).await
    }
}

#[tokio::test]
async fn clean_up_waits_for_in_flight_recovery_cycle() {
    let keys = QueueKeys::default();
    let memory = Arc::new(MemoryBroker::new());
    let recorder = Recorder::open();
    let pipeline = QueuePipeline::build(PipelineParts {
        broker: Arc::new(SlowPop {
            inner: memory.clone(),
            key: keys.failed_jobs.clone(),
            delay: Duration::from_millis(200),
        }),
        recovery_settings: RecoverySettings {
            interval: Duration::from_millis(20),
            max_attempts: 10,
        },
        ..parts(memory.clone(), recorder.clone())
    });
    pipeline.connect().await.unwrap();
    pipeline
        .spillover()
        .push(&FailedJobRecord::new(
            Uuid::new_v4(),
            Category::Alerts,
            json!({"deviceId": "SNS-42", "severity": "critical"}),
            "outage",
        ))
        .await
        .unwrap();

    pipeline.recovery().start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pipeline.clean_up().await.unwrap();

    let kept = memory.snapshot(&keys.failed_jobs).len()
        + memory.snapshot(&keys.waiting(Category::Alerts)).len()
        + recorder.seen().len();
    assert_eq!(kept, 1, "record must survive shutdown");
}

/// Fails every job.
struct AlwaysFails;

#[async_trait]
impl JobProcessor for AlwaysFails {
    fn name(&self) -> &'static str {
        "always-fails"
    }

    async fn process(&self, _: Category, _: &Value) -> Result<(), PipelineError> {
        Err(PipelineError::Processing("downstream rejected reading".to_string()))
    }
}

#[tokio::test]
async fn job_that_always_fails_ends_in_dead_letter() {
    let keys = QueueKeys::default();
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = QueuePipeline::build(PipelineParts {
        processors: ProcessorTable::uniform(Arc::new(AlwaysFails)),
        queue_settings: telemetry_queue::registry::QueueSettings {
            max_attempts: 1,
            max_replays: 2,
            ..fast_queue_settings()
        },
        ..parts(broker.clone(), Recorder::open())
    });
    pipeline.connect().await.unwrap();
    pipeline
        .add_alert(json!({"deviceId": "SNS-13", "severity": "warning"}))
        .await
        .unwrap();

    for _ in 0..2 {
        eventually("failed job record", || {
            broker.snapshot(&keys.failed_jobs).len() == 1
        })
        .await;
        let outcome = pipeline.recovery().run_cycle_now().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                recovered: 1,
                requeued: 0
            }
        );
    }

    eventually("dead letter", || broker.snapshot(&keys.dead_letter).len() == 1).await;
    assert!(broker.snapshot(&keys.failed_jobs).is_empty());
    assert_eq!(pipeline.get_queue_stats().await.queues["alerts"].failed, 3);
    assert_eq!(pipeline.get_recovery_stats().await.dead_letter_count, 1);
    pipeline.clean_up().await.unwrap();
}
