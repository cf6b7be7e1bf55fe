use crate::broker::{QueueKeys, SharedBroker};
use crate::error::{PipelineError, PipelineResult};
use crate::job::FailedJobRecord;
use crate::spool::{SpoolHandle, SpoolStatus};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillTarget {
    Broker,
    Local,
}

/// Durable home for Failed Job Records.
///
/// Records go to the broker's `failed_jobs` list; when the broker rejects the write they go to the
/// local spool instead. Reads drain the local spool before the broker list. Entries that cannot
/// be decoded are moved to the dead-letter list and never replayed.
#[derive(Clone)]
pub struct SpilloverStore {
    broker: SharedBroker,
    keys: QueueKeys,
    local: Option<SpoolHandle>,
    last_depth: Arc<AtomicU64>,
}

impl SpilloverStore {
    pub fn new(broker: SharedBroker, keys: QueueKeys, local: Option<SpoolHandle>) -> Self {
        Self {
            broker,
            keys,
            local,
            last_depth: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn push(&self, record: &FailedJobRecord) -> PipelineResult<SpillTarget> {
        let encoded = serde_json::to_string(record)
            .map_err(|err| PipelineError::Spillover(format!("encode record: {err}")))?;

        let broker_err = match self
            .broker
            .push_back(&self.keys.failed_jobs, encoded.clone())
            .await
        {
            Ok(()) => {
                self.last_depth.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job_id = %record.id, queue = %record.queue_name, "recorded failed job");
                return Ok(SpillTarget::Broker);
            }
            Err(err) => err,
        };

        let Some(local) = &self.local else {
            tracing::error!(
                error = %broker_err,
                job_id = %record.id,
                queue = %record.queue_name,
                payload = %record.payload,
                "spillover unavailable; job dropped"
            );
            return Err(PipelineError::Spillover(broker_err.to_string()));
        };

        match local.append(encoded.into_bytes()).await {
            Ok(()) => {
                self.last_depth.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %broker_err,
                    job_id = %record.id,
                    "broker rejected spillover record; written to local spool"
                );
                Ok(SpillTarget::Local)
            }
            Err(local_err) => {
                tracing::error!(
                    broker_error = %broker_err,
                    local_error = %local_err,
                    job_id = %record.id,
                    queue = %record.queue_name,
                    payload = %record.payload,
                    "spillover and local spool both failed; job dropped"
                );
                Err(PipelineError::Spillover(format!(
                    "{broker_err}; local spool: {local_err}"
                )))
            }
        }
    }

    /// Takes the oldest record, local spool first.
    pub async fn pop(&self) -> PipelineResult<Option<FailedJobRecord>> {
        if let Some(local) = &self.local {
            while let Some(bytes) = local
                .pop()
                .await
                .map_err(|err| PipelineError::Spillover(err.to_string()))?
            {
                self.note_removed();
                match serde_json::from_slice::<FailedJobRecord>(&bytes) {
                    Ok(record) => return Ok(Some(record)),
                    Err(err) => {
                        let raw = String::from_utf8_lossy(&bytes).into_owned();
                        self.dead_letter_raw(raw, &err.to_string()).await;
                    }
                }
            }
        }

        while let Some(raw) = self.broker.pop_front(&self.keys.failed_jobs).await? {
            self.note_removed();
            match serde_json::from_str::<FailedJobRecord>(&raw) {
                Ok(record) => return Ok(Some(record)),
                Err(err) => self.dead_letter_raw(raw, &err.to_string()).await,
            }
        }
        Ok(None)
    }

    pub async fn len(&self) -> PipelineResult<u64> {
        let local = match &self.local {
            Some(local) => local
                .len()
                .await
                .map_err(|err| PipelineError::Spillover(err.to_string()))?,
            None => 0,
        };
        let remote = self.broker.len(&self.keys.failed_jobs).await?;
        let depth = local + remote;
        self.last_depth.store(depth, Ordering::Relaxed);
        Ok(depth)
    }

    pub async fn local_status(&self) -> Option<SpoolStatus> {
        let local = self.local.as_ref()?;
        match local.status().await {
            Ok(status) => Some(status),
            Err(err) => {
                tracing::warn!(error = %err, "local spool status unavailable");
                None
            }
        }
    }

    /// Depth as last observed, without touching the broker.
    pub fn last_known_depth(&self) -> u64 {
        self.last_depth.load(Ordering::Relaxed)
    }

    /// Current depth, or the last observed depth when the broker cannot be reached.
    pub async fn depth_or_last_known(&self) -> u64 {
        match self.len().await {
            Ok(depth) => depth,
            Err(err) => {
                tracing::debug!(error = %err, "spillover depth unavailable; using last known");
                self.last_known_depth()
            }
        }
    }

    pub async fn dead_letter(&self, entry: Value) {
        let id = entry.get("id").cloned().unwrap_or(Value::Null);
        if let Err(err) = self
            .broker
            .push_back(&self.keys.dead_letter, entry.to_string())
            .await
        {
            tracing::error!(error = %err, job_id = %id, entry = %entry, "failed to write dead letter");
        } else {
            tracing::warn!(job_id = %id, "moved job to dead-letter list");
        }
    }

    pub async fn dead_letter_len(&self) -> PipelineResult<u64> {
        Ok(self.broker.len(&self.keys.dead_letter).await?)
    }

    async fn dead_letter_raw(&self, raw: String, error: &str) {
        self.dead_letter(json!({
            "id": Value::Null,
            "raw": raw,
            "error_message": format!("undecodable spillover record: {error}"),
            "recorded_at": Utc::now(),
        }))
        .await;
    }

    fn note_removed(&self) {
        let _ = self
            .last_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::job::Category;
    use crate::spool::spawn_spool_thread;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn record(n: u64) -> FailedJobRecord {
        FailedJobRecord::new(
            Uuid::new_v4(),
            Category::Alerts,
            json!({"deviceId": format!("SNS-{n}")}),
            "test",
        )
    }

    async fn connected_broker() -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn records_pop_oldest_first() {
        let broker = connected_broker().await;
        let store = SpilloverStore::new(broker.clone(), QueueKeys::default(), None);
        let first = record(1);
        let second = record(2);
        assert_eq!(store.push(&first).await.unwrap(), SpillTarget::Broker);
        store.push(&second).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 2);
        assert_eq!(store.pop().await.unwrap(), Some(first));
        assert_eq!(store.pop().await.unwrap(), Some(second));
        assert_eq!(store.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn broker_outage_without_local_spool_is_an_error() {
        let broker = connected_broker().await;
        let store = SpilloverStore::new(broker.clone(), QueueKeys::default(), None);
        broker.set_available(false);
        assert!(matches!(
            store.push(&record(1)).await,
            Err(PipelineError::Spillover(_))
        ));
    }

    #[tokio::test]
    async fn broker_outage_falls_back_to_local_spool() {
        let dir = TempDir::new().unwrap();
        let broker = connected_broker().await;
        let spool = spawn_spool_thread(dir.path().to_path_buf()).unwrap();
        let store = SpilloverStore::new(broker.clone(), QueueKeys::default(), Some(spool));

        broker.set_available(false);
        let spilled = record(1);
        assert_eq!(store.push(&spilled).await.unwrap(), SpillTarget::Local);
        assert_eq!(store.depth_or_last_known().await, 1);
        assert_eq!(store.local_status().await.map(|s| s.pending), Some(1));

        broker.set_available(true);
        let queued = record(2);
        store.push(&queued).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 2);
        assert_eq!(store.pop().await.unwrap(), Some(spilled));
        assert_eq!(store.pop().await.unwrap(), Some(queued));
    }

    #[tokio::test]
    async fn undecodable_entries_move_to_dead_letter() {
        let broker = connected_broker().await;
        let keys = QueueKeys::default();
        let store = SpilloverStore::new(broker.clone(), keys.clone(), None);
        broker
            .push_back(&keys.failed_jobs, "not json".to_string())
            .await
            .unwrap();
        let good = record(3);
        store.push(&good).await.unwrap();

        assert_eq!(store.pop().await.unwrap(), Some(good));
        assert_eq!(store.dead_letter_len().await.unwrap(), 1);
        let dead: Value = serde_json::from_str(&broker.snapshot(&keys.dead_letter)[0]).unwrap();
        assert_eq!(dead["raw"], "not json");
    }
}
