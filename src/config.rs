use crate::broker::QueueKeys;
use crate::codec::{CodecConfig, CompressionAlgorithm, DEFAULT_THRESHOLD_BYTES};
use crate::job::Category;
use crate::recovery::RecoverySettings;
use crate::registry::QueueSettings;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerKind,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_tls: bool,

    pub key_prefix: String,
    pub failed_jobs_key: String,
    pub dead_letter_key: String,

    pub sensor_data_concurrency: usize,
    pub analytics_concurrency: usize,
    pub alerts_concurrency: usize,
    pub max_attempts: u32,
    pub max_replays: u32,
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    pub operation_timeout: Duration,
    pub shutdown_grace: Duration,

    pub compression_threshold_bytes: usize,
    pub compression_algorithm: CompressionAlgorithm,
    pub compression_level: u32,

    pub probe_interval: Duration,
    pub recovery_interval: Duration,
    pub recovery_max_attempts: u32,
    pub recovery_autostart: bool,

    pub spillover_local_dir: Option<PathBuf>,

    pub http_bind: String,
    pub admin_token: Option<String>,

    pub sink_sensor_data_url: Option<String>,
    pub sink_analytics_url: Option<String>,
    pub sink_alerts_url: Option<String>,
    pub sink_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let queues = QueueSettings::default();
        let keys = QueueKeys::default();
        let recovery = RecoverySettings::default();
        Self {
            broker: BrokerKind::Redis,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_tls: false,
            key_prefix: keys.prefix,
            failed_jobs_key: keys.failed_jobs,
            dead_letter_key: keys.dead_letter,
            sensor_data_concurrency: queues.sensor_data_concurrency,
            analytics_concurrency: queues.analytics_concurrency,
            alerts_concurrency: queues.alerts_concurrency,
            max_attempts: queues.max_attempts,
            max_replays: queues.max_replays,
            backoff_base: queues.backoff_base,
            poll_interval: queues.poll_interval,
            operation_timeout: Duration::from_millis(2000),
            shutdown_grace: queues.shutdown_grace,
            compression_threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            compression_algorithm: CompressionAlgorithm::Gzip,
            compression_level: 6,
            probe_interval: Duration::from_millis(5000),
            recovery_interval: recovery.interval,
            recovery_max_attempts: recovery.max_attempts,
            recovery_autostart: true,
            spillover_local_dir: Some(PathBuf::from("./data/spillover")),
            http_bind: "0.0.0.0:8090".to_string(),
            admin_token: None,
            sink_sensor_data_url: None,
            sink_analytics_url: None,
            sink_alerts_url: None,
            sink_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let broker = match env_string("QUEUE_BROKER", Some("redis".to_string()))?
            .to_lowercase()
            .as_str()
        {
            "redis" => BrokerKind::Redis,
            "memory" => BrokerKind::Memory,
            other => return Err(anyhow!("invalid QUEUE_BROKER {other:?} (expected redis|memory)")),
        };

        let redis_port = u16::try_from(env_u64("REDIS_PORT", Some(defaults.redis_port as u64))?)
            .context("invalid REDIS_PORT")?;

        let compression_algorithm = env_string("QUEUE_COMPRESSION_ALGORITHM", Some("gzip".to_string()))?
            .parse::<CompressionAlgorithm>()
            .map_err(|err| anyhow!(err))
            .context("invalid QUEUE_COMPRESSION_ALGORITHM")?;
        let compression_level = env_u64("QUEUE_COMPRESSION_LEVEL", Some(6))?;
        if compression_level > 9 {
            return Err(anyhow!("QUEUE_COMPRESSION_LEVEL must be 0-9, got {compression_level}"));
        }

        // Explicitly empty disables the local spool.
        let spillover_local_dir = match env::var("SPILLOVER_LOCAL_DIR") {
            Ok(raw) if raw.trim().is_empty() => None,
            Ok(raw) => Some(PathBuf::from(raw.trim())),
            Err(_) => defaults.spillover_local_dir.clone(),
        };

        Ok(Self {
            broker,
            redis_host: env_string("REDIS_HOST", Some(defaults.redis_host.clone()))?,
            redis_port,
            redis_password: env_optional("REDIS_PASSWORD"),
            redis_tls: env_bool("REDIS_TLS", false),
            key_prefix: env_string("QUEUE_KEY_PREFIX", Some(defaults.key_prefix.clone()))?,
            failed_jobs_key: env_string("QUEUE_FAILED_JOBS_KEY", Some(defaults.failed_jobs_key.clone()))?,
            dead_letter_key: env_string("QUEUE_DEAD_LETTER_KEY", Some(defaults.dead_letter_key.clone()))?,
            sensor_data_concurrency: env_u64("QUEUE_SENSOR_DATA_CONCURRENCY", Some(5))? as usize,
            analytics_concurrency: env_u64("QUEUE_ANALYTICS_CONCURRENCY", Some(2))? as usize,
            alerts_concurrency: env_u64("QUEUE_ALERTS_CONCURRENCY", Some(3))? as usize,
            max_attempts: env_u64("QUEUE_MAX_ATTEMPTS", Some(3))?.clamp(1, u32::MAX as u64) as u32,
            max_replays: env_u64("QUEUE_MAX_REPLAYS", Some(5))?.min(u32::MAX as u64) as u32,
            backoff_base: Duration::from_millis(env_u64("QUEUE_BACKOFF_MS", Some(1000))?),
            poll_interval: Duration::from_millis(env_u64("QUEUE_POLL_INTERVAL_MS", Some(250))?.max(1)),
            operation_timeout: Duration::from_millis(
                env_u64("QUEUE_OPERATION_TIMEOUT_MS", Some(2000))?.max(1),
            ),
            shutdown_grace: Duration::from_millis(env_u64("QUEUE_SHUTDOWN_GRACE_MS", Some(10_000))?),
            compression_threshold_bytes: env_u64(
                "QUEUE_COMPRESSION_THRESHOLD_BYTES",
                Some(DEFAULT_THRESHOLD_BYTES as u64),
            )? as usize,
            compression_algorithm,
            compression_level: compression_level as u32,
            probe_interval: Duration::from_millis(env_u64("HEALTH_PROBE_INTERVAL_MS", Some(5000))?.max(1)),
            recovery_interval: Duration::from_millis(
                env_u64("RECOVERY_INTERVAL_MS", Some(60_000))?.max(1),
            ),
            recovery_max_attempts: env_u64("RECOVERY_MAX_ATTEMPTS", Some(10))?.clamp(1, u32::MAX as u64)
                as u32,
            recovery_autostart: env_bool("RECOVERY_AUTOSTART", true),
            spillover_local_dir,
            http_bind: env_string("QUEUE_HTTP_BIND", Some(defaults.http_bind.clone()))?,
            admin_token: env_optional("QUEUE_ADMIN_TOKEN"),
            sink_sensor_data_url: env_optional("SINK_SENSOR_DATA_URL"),
            sink_analytics_url: env_optional("SINK_ANALYTICS_URL"),
            sink_alerts_url: env_optional("SINK_ALERTS_URL"),
            sink_token: env_optional("SINK_TOKEN"),
        })
    }

    /// `redis://` or `rediss://` URL including the password, if any.
    pub fn redis_url(&self) -> Result<String> {
        let scheme = if self.redis_tls { "rediss" } else { "redis" };
        let mut url = Url::parse(&format!("{scheme}://{}:{}/", self.redis_host, self.redis_port))
            .context("invalid REDIS_HOST/REDIS_PORT")?;
        if let Some(password) = &self.redis_password {
            url.set_password(Some(password))
                .map_err(|_| anyhow!("cannot attach REDIS_PASSWORD to broker url"))?;
        }
        Ok(url.to_string())
    }

    /// Same as [`Config::redis_url`] with the password masked, for logs.
    pub fn redis_url_redacted(&self) -> String {
        let scheme = if self.redis_tls { "rediss" } else { "redis" };
        let auth = if self.redis_password.is_some() { ":***@" } else { "" };
        format!("{scheme}://{auth}{}:{}/", self.redis_host, self.redis_port)
    }

    pub fn queue_keys(&self) -> QueueKeys {
        QueueKeys {
            prefix: self.key_prefix.clone(),
            failed_jobs: self.failed_jobs_key.clone(),
            dead_letter: self.dead_letter_key.clone(),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            sensor_data_concurrency: self.sensor_data_concurrency,
            analytics_concurrency: self.analytics_concurrency,
            alerts_concurrency: self.alerts_concurrency,
            max_attempts: self.max_attempts,
            max_replays: self.max_replays,
            backoff_base: self.backoff_base,
            poll_interval: self.poll_interval,
            shutdown_grace: self.shutdown_grace,
        }
    }

    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            threshold_bytes: self.compression_threshold_bytes,
            algorithm: self.compression_algorithm,
            level: self.compression_level,
        }
    }

    pub fn recovery_settings(&self) -> RecoverySettings {
        RecoverySettings {
            interval: self.recovery_interval,
            max_attempts: self.recovery_max_attempts,
        }
    }

    pub fn sink_url(&self, category: Category) -> Option<&str> {
        match category {
            Category::SensorData => self.sink_sensor_data_url.as_deref(),
            Category::Analytics => self.sink_analytics_url.as_deref(),
            Category::Alerts => self.sink_alerts_url.as_deref(),
        }
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    parse_bool(env::var(key).ok().as_deref()).unwrap_or(default)
}

fn parse_bool(raw: Option<&str>) -> Option<bool> {
    match raw.map(|value| value.trim().to_lowercase()) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => Some(true),
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => Some(false),
        _ => None,
    }
}
