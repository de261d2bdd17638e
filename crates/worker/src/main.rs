//! GymFlow billing worker
//!
//! Runs migrations, then schedules the daily billing cycle and the webhook
//! queue drain until interrupted.

mod config;
mod webhook_processor;

use std::sync::Arc;

use anyhow::Context;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

use gymflow_billing::BillingEngine;
use gymflow_shared::{create_pool, run_migrations};

use crate::config::{LogFormat, WorkerConfig};

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gymflow_billing=debug"));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match format {
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    init_tracing(config.log_format);

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let engine = Arc::new(
        BillingEngine::stripe_from_env(pool).context("Failed to configure billing engine")?,
    );

    let mut scheduler = JobScheduler::new().await?;

    let cycle_engine = engine.clone();
    scheduler
        .add(Job::new_async(config.billing_cron.as_str(), move |_id, _scheduler| {
            let engine = cycle_engine.clone();
            Box::pin(async move {
                let started = OffsetDateTime::now_utc();
                tracing::info!(run_at = %started, "Billing cycle started");
                let report = engine.cycle.run(started).await;
                tracing::info!(report = ?report, "Billing cycle finished");
            })
        })?)
        .await?;

    let drain_engine = engine.clone();
    let batch_size = config.webhook_batch_size;
    let retention_days = config.webhook_retention_days;
    scheduler
        .add(Job::new_async(config.webhook_drain_cron.as_str(), move |_id, _scheduler| {
            let engine = drain_engine.clone();
            Box::pin(async move {
                let store = engine.store().as_ref();
                let report = webhook_processor::process_webhook_queue(
                    store,
                    &engine.reconciler,
                    batch_size,
                    OffsetDateTime::now_utc(),
                )
                .await;
                if report.processed + report.failed > 0 {
                    tracing::info!(
                        processed = report.processed,
                        failed = report.failed,
                        "Webhook queue drained"
                    );
                }
                webhook_processor::cleanup_old_webhooks(store, retention_days).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!(
        billing_cron = %config.billing_cron,
        webhook_drain_cron = %config.webhook_drain_cron,
        "Worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down worker");
    scheduler.shutdown().await?;

    Ok(())
}
