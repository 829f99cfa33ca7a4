use std::sync::Arc;

use anyhow::Context;
use clinical_event_bus::{BusConfig, BusRuntime};
use clinical_notifications::consumer_tasks::register_consumers;
use clinical_notifications::handlers::{LogAlertSink, LogAuditSink};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = BusConfig::from_env().context("invalid event bus configuration")?;
    if std::env::var("SERVICE_NAME").is_err() {
        config.service_name = "notifications".to_string();
    }

    tracing::info!(
        service = %config.service_name,
        broker = ?config.broker,
        partitions = config.partitions,
        "Starting notifications service"
    );

    let runtime = BusRuntime::from_config(config).context("failed to create event bus")?;
    register_consumers(&runtime, Arc::new(LogAlertSink), Arc::new(LogAuditSink))
        .await
        .context("failed to register consumers")?;

    // Connection failure here is fatal: the process exits non-zero
    runtime.start().await.context("failed to start event bus")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received, draining consumers");
    runtime.stop().await;

    Ok(())
}
