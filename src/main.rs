use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fora_farm::config::Config;
use fora_farm::db::{self, PgStore};
use fora_farm::jobs::Maintenance;
use fora_farm::services::{fora::ForaClient, smshub::SmsHubClient};
use fora_farm::telemetry::{BufferLayer, LogBuffer, LogShipper, LokiConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_buffer = LogBuffer::default();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fora_farm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BufferLayer::new(log_buffer.clone()))
        .init();

    tracing::info!("Starting fora-farm...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let maintenance = Arc::new(Maintenance::new(
        Arc::new(PgStore::new(pool)),
        Arc::new(ForaClient::new(&config.fora_api_url)?),
        Arc::new(SmsHubClient::new(
            &config.smshub_api_url,
            config.smshub_api_key.clone(),
        )?),
        config.maintenance.clone(),
        LogShipper::new(log_buffer, LokiConfig::from_config(&config)),
    ));

    if config.run_once {
        let report = maintenance.run().await?;
        tracing::info!(?report, "Single maintenance run finished");
        return Ok(());
    }

    // Overlapping ticks are skipped while a run is in progress
    let running = Arc::new(Mutex::new(()));
    let mut scheduler = JobScheduler::new().await?;
    let job = Job::new_async(config.maintenance_schedule.as_str(), move |_id, _scheduler| {
        let maintenance = maintenance.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                tracing::warn!("Previous maintenance run still in progress, skipping");
                return;
            };
            if let Err(e) = maintenance.run().await {
                tracing::error!(error = %e, "Maintenance run failed");
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    tracing::info!(schedule = %config.maintenance_schedule, "Maintenance scheduled");

    shutdown_signal().await?;
    scheduler.shutdown().await?;

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, cleaning up...");
    Ok(())
}
