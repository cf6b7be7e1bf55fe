use crate::config::Config;
use crate::error::PipelineError;
use crate::job::Category;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const SINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Downstream collaborator a worker hands each decoded payload to.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, category: Category, payload: &Value) -> Result<(), PipelineError>;
}

pub type SharedProcessor = Arc<dyn JobProcessor>;

/// Fixed category -> processor mapping, resolved once at startup.
#[derive(Clone)]
pub struct ProcessorTable {
    sensor_data: SharedProcessor,
    analytics: SharedProcessor,
    alerts: SharedProcessor,
}

impl ProcessorTable {
    pub fn new(
        sensor_data: SharedProcessor,
        analytics: SharedProcessor,
        alerts: SharedProcessor,
    ) -> Self {
        Self {
            sensor_data,
            analytics,
            alerts,
        }
    }

    pub fn uniform(processor: SharedProcessor) -> Self {
        Self::new(processor.clone(), processor.clone(), processor)
    }

    pub fn with(mut self, category: Category, processor: SharedProcessor) -> Self {
        match category {
            Category::SensorData => self.sensor_data = processor,
            Category::Analytics => self.analytics = processor,
            Category::Alerts => self.alerts = processor,
        }
        self
    }

    /// HTTP sinks for categories with a configured URL, logging for the rest.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let mut table = Self::uniform(Arc::new(LogProcessor));
        for category in Category::ALL {
            if let Some(url) = config.sink_url(category) {
                let sink = HttpSinkProcessor::new(url.to_string(), config.sink_token.clone())?;
                tracing::info!(queue = %category, url, "forwarding queue to http sink");
                table = table.with(category, Arc::new(sink));
            }
        }
        Ok(table)
    }

    pub fn get(&self, category: Category) -> SharedProcessor {
        match category {
            Category::SensorData => self.sensor_data.clone(),
            Category::Analytics => self.analytics.clone(),
            Category::Alerts => self.alerts.clone(),
        }
    }
}

impl Default for ProcessorTable {
    fn default() -> Self {
        Self::uniform(Arc::new(LogProcessor))
    }
}

#[derive(Debug, Default)]
pub struct LogProcessor;

#[async_trait]
impl JobProcessor for LogProcessor {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn process(&self, category: Category, payload: &Value) -> Result<(), PipelineError> {
        match category {
            Category::Alerts => tracing::info!(queue = %category, %payload, "alert received"),
            _ => tracing::debug!(queue = %category, %payload, "processed job"),
        }
        Ok(())
    }
}

pub struct HttpSinkProcessor {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpSinkProcessor {
    pub fn new(url: String, token: Option<String>) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(SINK_TIMEOUT)
            .build()
            .map_err(|err| PipelineError::Processing(format!("build http client: {err}")))?;
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl JobProcessor for HttpSinkProcessor {
    fn name(&self) -> &'static str {
        "http-sink"
    }

    async fn process(&self, category: Category, payload: &Value) -> Result<(), PipelineError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("X-Queue-Name", category.queue_name())
            .json(payload);
        if let Some(token) = &self.token {
            request = request.header("X-Ingest-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| PipelineError::Processing(format!("{}: {err}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, queue = %category, url = %self.url, "sink returned non-success");
            return Err(PipelineError::Processing(format!(
                "{} returned {status}",
                self.url
            )));
        }
        Ok(())
    }
}
