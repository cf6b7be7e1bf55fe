mod memory;
mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

use crate::error::BrokerError;
use crate::job::Category;
use async_trait::async_trait;
use std::sync::Arc;

/// List-structured store backing the queues and the spillover list.
///
/// Producers append with [`Broker::push_back`] and consumers take from the head with
/// [`Broker::pop_front`], which makes every list FIFO.
#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn connect(&self) -> Result<(), BrokerError>;

    /// Lightweight liveness check.
    async fn ping(&self) -> Result<(), BrokerError>;

    async fn close(&self);

    async fn push_back(&self, key: &str, value: String) -> Result<(), BrokerError>;

    async fn pop_front(&self, key: &str) -> Result<Option<String>, BrokerError>;

    async fn len(&self, key: &str) -> Result<u64, BrokerError>;
}

pub type SharedBroker = Arc<dyn Broker>;

#[derive(Debug, Clone)]
pub struct QueueKeys {
    pub prefix: String,
    pub failed_jobs: String,
    pub dead_letter: String,
}

impl QueueKeys {
    pub fn waiting(&self, category: Category) -> String {
        format!("{}:{}:waiting", self.prefix, category.queue_name())
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self {
            prefix: "telemetry".to_string(),
            failed_jobs: "failed_jobs".to_string(),
            dead_letter: "failed_jobs:dead".to_string(),
        }
    }
}
