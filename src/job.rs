use crate::codec::StoredPayload;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "sensor-data")]
    SensorData,
    #[serde(rename = "analytics")]
    Analytics,
    #[serde(rename = "alerts")]
    Alerts,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::SensorData, Category::Analytics, Category::Alerts];

    pub fn queue_name(self) -> &'static str {
        match self {
            Category::SensorData => "sensor-data",
            Category::Analytics => "analytics",
            Category::Alerts => "alerts",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

impl FromStr for Category {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "sensor-data" | "sensor_data" | "sensorData" => Ok(Category::SensorData),
            "analytics" => Ok(Category::Analytics),
            "alerts" | "alert" => Ok(Category::Alerts),
            other => Err(PipelineError::UnknownCategory(other.to_string())),
        }
    }
}

/// Unit of work as stored on a queue list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "queue_name")]
    pub category: Category,
    pub payload: StoredPayload,
    pub enqueued_at: DateTime<Utc>,
    /// Processing attempts already spent on earlier passes.
    #[serde(default)]
    pub attempts: u32,
    /// Times the job was replayed from spillover.
    #[serde(default)]
    pub replays: u32,
}

impl Job {
    pub fn new(category: Category, payload: StoredPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            replays: 0,
        }
    }

    pub fn compressed(&self) -> bool {
        self.payload.is_compressed()
    }
}

/// A job that could not be processed (or was never queued) and awaits replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub id: JobId,
    pub queue_name: Category,
    pub payload: Value,
    pub failed_at: DateTime<Utc>,
    pub error_message: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub replays: u32,
}

impl FailedJobRecord {
    pub fn new(id: JobId, category: Category, payload: Value, error: impl Into<String>) -> Self {
        Self {
            id,
            queue_name: category,
            payload,
            failed_at: Utc::now(),
            error_message: error.into(),
            attempts: 0,
            replays: 0,
        }
    }

    /// Carries the attempt history of the job that produced this record.
    pub fn with_history(mut self, attempts: u32, replays: u32) -> Self {
        self.attempts = attempts;
        self.replays = replays;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueRoute {
    Queued,
    Spilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub id: JobId,
    pub route: EnqueueRoute,
}
