use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_queue::auth::AdminToken;
use telemetry_queue::config::Config;
use telemetry_queue::http::{router, HttpState};
use telemetry_queue::pipeline::QueuePipeline;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_queue=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let pipeline = Arc::new(QueuePipeline::from_config(&config)?);
    match pipeline.connect().await {
        Ok(()) => tracing::info!(broker = %config.redis_url_redacted(), "broker connected"),
        Err(err) => {
            tracing::warn!(error = %err, "broker unavailable at startup; running degraded")
        }
    }
    pipeline
        .create_queues()
        .context("failed to create queues")?;
    if config.recovery_autostart {
        pipeline.recovery().start();
    }

    let app = router(HttpState {
        pipeline: pipeline.clone(),
        admin: AdminToken::new(config.admin_token.clone()),
    });
    if config.admin_token.is_none() {
        tracing::warn!("QUEUE_ADMIN_TOKEN not set; admin endpoints will reject every request");
    }
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "telemetry-queue HTTP listening");
    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "http server exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {}
    }

    pipeline.clean_up().await?;
    Ok(())
}
