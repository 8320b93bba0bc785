mod handlers;

use std::sync::Arc;
use std::time::Duration;
use taskforge_core::executor::InProcessUnit;
use taskforge_core::{config::Config, db, facade::JobForge, reclaimer::Reclaimer, scheduler::Scheduler, store::PgStore, Supervisor};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env()?;

    tracing::info!(
        worker_id = %cfg.worker_id,
        max_concurrent = cfg.max_concurrent,
        lease_duration_seconds = cfg.lease_duration_seconds,
        process_isolation = cfg.process_isolation,
        "taskforge worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store = PgStore::new(pool.clone());
    let registry = handlers::build_registry();
    let unit: Arc<dyn taskforge_core::executor::ExecutionUnit> = Arc::new(InProcessUnit);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let supervisor = Supervisor::new(store.clone(), registry, cfg.clone(), unit);
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx.clone()));

    let reclaimer = Reclaimer::new(store.clone(), Duration::from_secs(cfg.lease_duration_seconds as u64));
    let reclaimer_handle = tokio::spawn(reclaimer.run(shutdown_rx.clone()));

    let scheduler = Scheduler::new(store.clone(), pool.clone(), Duration::from_secs(5));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let api_handle = if let Some(addr) = cfg.admin_addr.clone() {
        let app = taskforge_core::api::router(JobForge::new(store.clone()));
        let mut api_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.changed().await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = supervisor_handle.await;
    let _ = reclaimer_handle.await;
    let _ = scheduler_handle.await;
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }

    Ok(())
}
