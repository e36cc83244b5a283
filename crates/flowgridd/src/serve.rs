//! `serve`: the scheduler loop plus housekeeping services over one store.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use flowgrid_core::{ResolvedSettings, SchedulerSettings};
use flowgrid_housekeeping::{
    CancellationCleanup, CancellationCleanupConfig, LateRuns, LateRunsConfig, PauseExpirations,
    PauseExpirationsConfig, ServiceManager,
};
use flowgrid_lifecycle::Lifecycle;
use flowgrid_recurrence::SchedulingBounds;
use flowgrid_scheduler::{MaterializerConfig, Scheduler, SchedulerConfig};
use flowgrid_state::{EventSink, LogSink, RetryPolicy, StateStore};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub async fn run(settings: ResolvedSettings) -> anyhow::Result<()> {
    info!("flowgrid daemon starting");

    if let Some(parent) = settings.store_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(StateStore::open(&settings.store_path)?);
    info!(path = ?settings.store_path, "state store opened");

    let events: Arc<dyn EventSink> = Arc::new(LogSink);
    let retry = RetryPolicy::new(
        settings.store.retry_attempts,
        settings.store.retry_base_delay(),
    );
    let lifecycle = Lifecycle::new(store.clone())
        .with_events(events.clone())
        .with_retry(retry);

    let services = &settings.services;
    let mut manager = ServiceManager::new();

    // ── Scheduler ──────────────────────────────────────────────

    let scheduler_handle = if services.scheduler.enabled {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            store.clone(),
            events.clone(),
            scheduler_config(&services.scheduler),
            MaterializerConfig {
                insert_batch_size: services.scheduler.insert_batch_size,
                bounds: scheduling_bounds(&services.scheduler)?,
                retry,
            },
        ));
        let shutdown = manager.shutdown_signal();
        Some(tokio::spawn(async move { scheduler.run(shutdown).await }))
    } else {
        info!("scheduler disabled");
        None
    };

    // ── Housekeeping ───────────────────────────────────────────

    if services.late_runs.enabled {
        manager.spawn(Arc::new(LateRuns::new(
            lifecycle.clone(),
            LateRunsConfig {
                loop_interval: services.late_runs.loop_interval(),
                after: delta(services.late_runs.after())?,
                batch_size: services.late_runs.batch_size,
            },
        )));
    }
    if services.pause_expirations.enabled {
        manager.spawn(Arc::new(PauseExpirations::new(
            lifecycle.clone(),
            PauseExpirationsConfig {
                loop_interval: services.pause_expirations.loop_interval(),
                batch_size: services.pause_expirations.batch_size,
            },
        )));
    }
    if services.cancellation_cleanup.enabled {
        manager.spawn(Arc::new(CancellationCleanup::new(
            lifecycle.clone(),
            CancellationCleanupConfig {
                loop_interval: services.cancellation_cleanup.loop_interval(),
                batch_size: services.cancellation_cleanup.batch_size,
                lookback: delta(services.cancellation_cleanup.lookback())?,
            },
        )));
    }
    info!(services = ?manager.running(), "housekeeping services started");

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    manager.stop_all().await;
    if let Some(handle) = scheduler_handle {
        join_service("scheduler", handle).await;
    }

    info!("flowgrid daemon stopped");
    Ok(())
}

/// Wait for a service task; a panic is logged, not propagated.
async fn join_service(name: &'static str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(service = name, error = %e, "service task panicked");
            false
        }
    }
}

pub(crate) fn scheduler_config(settings: &SchedulerSettings) -> SchedulerConfig {
    SchedulerConfig {
        loop_interval: settings.loop_interval(),
        deployment_batch_size: settings.deployment_batch_size,
        max_concurrency: settings.max_concurrency,
        ..SchedulerConfig::default()
    }
}

pub(crate) fn scheduling_bounds(settings: &SchedulerSettings) -> anyhow::Result<SchedulingBounds> {
    Ok(SchedulingBounds {
        min_runs: settings.min_runs,
        max_runs: settings.max_runs,
        min_scheduled_time: delta(settings.min_scheduled_time())?,
        max_scheduled_time: delta(settings.max_scheduled_time())?,
    })
}

fn delta(duration: Duration) -> anyhow::Result<TimeDelta> {
    Ok(TimeDelta::from_std(duration)?)
}
