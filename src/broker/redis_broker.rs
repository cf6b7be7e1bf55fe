use super::Broker;
use crate::error::BrokerError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct RedisBroker {
    client: Client,
    manager: RwLock<Option<ConnectionManager>>,
    operation_timeout: Duration,
}

impl RedisBroker {
    pub fn new(url: &str, operation_timeout: Duration) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|err| BrokerError::Command(err.to_string()))?;
        Ok(Self {
            client,
            manager: RwLock::new(None),
            operation_timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, BrokerError> {
        self.manager
            .read()
            .await
            .clone()
            .ok_or_else(|| BrokerError::Unavailable("not connected".to_string()))
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, BrokerError> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_redis_error(op, err)),
            Err(_) => Err(BrokerError::Timeout(
                self.operation_timeout.as_millis() as u64,
            )),
        }
    }
}

fn map_redis_error(op: &str, err: RedisError) -> BrokerError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        BrokerError::Unavailable(format!("{op}: {err}"))
    } else {
        BrokerError::Command(format!("{op}: {err}"))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        let manager = self
            .bounded("CONNECT", ConnectionManager::new(self.client.clone()))
            .await?;
        *self.manager.write().await = Some(manager);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        self.bounded("PING", async {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }

    async fn close(&self) {
        self.manager.write().await.take();
    }

    async fn push_back(&self, key: &str, value: String) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        self.bounded("RPUSH", async {
            redis::cmd("RPUSH")
                .arg(key)
                .arg(&value)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.connection().await?;
        self.bounded("LPOP", async {
            redis::cmd("LPOP")
                .arg(key)
                .query_async::<Option<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn len(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.connection().await?;
        self.bounded("LLEN", async {
            redis::cmd("LLEN").arg(key).query_async::<u64>(&mut conn).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[tokio::test]
    async fn operations_before_connect_are_unavailable() {
        let broker =
            RedisBroker::new("redis://127.0.0.1:6379", Duration::from_millis(200)).unwrap();
        let err = broker.ping().await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn redis_list_round_trip() {
        let Ok(url) = env::var("QUEUE_REDIS_TEST_URL") else {
            return;
        };
        let broker = RedisBroker::new(&url, Duration::from_secs(2)).unwrap();
        broker.connect().await.unwrap();
        broker.ping().await.unwrap();

        let key = format!("telemetry-queue-test:{}", uuid::Uuid::new_v4());
        broker.push_back(&key, "first".to_string()).await.unwrap();
        broker.push_back(&key, "second".to_string()).await.unwrap();
        assert_eq!(broker.len(&key).await.unwrap(), 2);
        assert_eq!(broker.pop_front(&key).await.unwrap().as_deref(), Some("first"));
        assert_eq!(broker.pop_front(&key).await.unwrap().as_deref(), Some("second"));
        assert_eq!(broker.pop_front(&key).await.unwrap(), None);
        broker.close().await;
    }
}
