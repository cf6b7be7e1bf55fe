//! In-process broker used for local development and tests.
//!
//! Outages are simulated with [`MemoryBroker::set_available`]; individual keys can be made to
//! fail with [`MemoryBroker::fail_key`] while the broker itself stays reachable.

use super::Broker;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct MemoryBroker {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    failing_keys: Mutex<HashSet<String>>,
    available: AtomicBool,
    connected: AtomicBool,
    operations: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            failing_keys: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            operations: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_key(&self, key: &str, failing: bool) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            if failing {
                keys.insert(key.to_string());
            } else {
                keys.remove(key);
            }
        }
    }

    pub fn snapshot(&self, key: &str) -> Vec<String> {
        self.lists
            .lock()
            .map(|lists| {
                lists
                    .get(key)
                    .map(|list| list.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    fn check(&self, key: Option<&str>) -> Result<(), BrokerError> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker offline".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("not connected".to_string()));
        }
        if let Some(key) = key {
            let failing = self
                .failing_keys
                .lock()
                .map(|keys| keys.contains(key))
                .unwrap_or(false);
            if failing {
                return Err(BrokerError::Command(format!("injected failure on {key}")));
            }
        }
        Ok(())
    }

    fn lists(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<String>>>, BrokerError> {
        self.lists
            .lock()
            .map_err(|_| BrokerError::Command("memory broker lock poisoned".to_string()))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker offline".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.check(None)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn push_back(&self, key: &str, value: String) -> Result<(), BrokerError> {
        self.check(Some(key))?;
        self.lists()?.entry(key.to_string()).or_default().push_back(value);
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, BrokerError> {
        self.check(Some(key))?;
        Ok(self.lists()?.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn len(&self, key: &str) -> Result<u64, BrokerError> {
        self.check(Some(key))?;
        Ok(self.lists()?.get(key).map(|list| list.len() as u64).unwrap_or(0))
    }
}
