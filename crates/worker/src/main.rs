#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Agora Background Worker
//!
//! Handles scheduled jobs including:
//! - Monthly earnings rollover, recomputed from the ledger (1st of the month)
//! - Billing invariant checks (hourly)
//! - Stale webhook claim recovery (every 15 minutes)
//! - Heartbeat (every 5 minutes)

mod jobs;
mod schedule;

use std::sync::Arc;

use agora_billing::InvariantChecker;
use agora_shared::{create_pool, BillingStore, PgStore};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::schedule::WorkerSchedule;

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agora_worker=debug".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Agora Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, 5).await?;
    info!("Database pool created");

    let store: Arc<dyn BillingStore> = Arc::new(PgStore::new(pool.clone()));
    let checker = Arc::new(InvariantChecker::new(pool));
    let schedule = WorkerSchedule::from_env()?;

    // Catch up on a rollover missed while the worker was down
    if let Err(e) = jobs::rollover_monthly_earnings(store.as_ref(), OffsetDateTime::now_utc()).await
    {
        error!(error = %e, "Startup earnings rollover failed");
    }

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Monthly earnings rollover
    let rollover_store = store.clone();
    scheduler
        .add(Job::new_async(
            schedule.earnings_rollover.as_str(),
            move |_uuid, _l| {
                let store = rollover_store.clone();
                Box::pin(async move {
                    info!("Running monthly earnings rollover");
                    if let Err(e) =
                        jobs::rollover_monthly_earnings(store.as_ref(), OffsetDateTime::now_utc())
                            .await
                    {
                        error!(error = %e, "Monthly earnings rollover failed");
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %schedule.earnings_rollover, "Scheduled: Monthly earnings rollover");

    // Job 2: Billing invariant checks
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async(
            schedule.invariant_checks.as_str(),
            move |_uuid, _l| {
                let checker = invariant_checker.clone();
                Box::pin(async move {
                    if let Err(e) = jobs::run_invariant_checks(&checker).await {
                        error!(error = %e, "Invariant checks failed to run");
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %schedule.invariant_checks, "Scheduled: Billing invariant checks");

    // Job 3: Stale webhook claim recovery
    let recovery_store = store.clone();
    scheduler
        .add(Job::new_async(
            schedule.claim_recovery.as_str(),
            move |_uuid, _l| {
                let store = recovery_store.clone();
                Box::pin(async move {
                    if let Err(e) =
                        jobs::recover_stale_claims(store.as_ref(), OffsetDateTime::now_utc()).await
                    {
                        error!(error = %e, "Webhook claim recovery failed");
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %schedule.claim_recovery, "Scheduled: Stale webhook claim recovery");

    // Job 4: Heartbeat
    scheduler
        .add(Job::new_async(schedule.heartbeat.as_str(), |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!(cron = %schedule.heartbeat, "Scheduled: Heartbeat");

    scheduler.start().await?;
    info!("Worker started, waiting for jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.shutdown().await?;

    Ok(())
}
