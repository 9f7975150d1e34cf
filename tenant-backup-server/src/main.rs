use std::sync::Arc;
use tenant_backup_server::config::{AppConfig, ScheduleMode};
use tenant_backup_server::db::connection::{close_pool, create_pool};
use tenant_backup_server::db::migrate::migrate;
use tenant_backup_server::routes;
use tenant_backup_server::services::backup_scheduler::{run_scheduler_loop, BackupScheduler};
use tenant_backup_server::state::AppState;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // Initialize database
    let pool = create_pool(&config.db_path)?;
    migrate(&pool)?;

    // Build application state; an unknown storage driver stops startup here
    let state = Arc::new(AppState::new(pool, config.clone())?);
    tracing::info!(
        storage = %config.backup.storage_path.display(),
        driver = %config.backup.storage_driver,
        "Backup storage ready"
    );

    let cancel = CancellationToken::new();

    match config.backup.schedule_mode {
        ScheduleMode::Worker => {
            tracing::info!("Starting backup scheduler worker");
            let worker = tokio::spawn(run_scheduler_loop(state.clone(), cancel.clone()));
            shutdown_signal(cancel.clone()).await;
            worker.await?;
        }
        ScheduleMode::App => serve(state.clone(), &config, cancel.clone()).await?,
    }

    // Close database
    close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn serve(state: Arc<AppState>, config: &AppConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    tracing::info!("Starting backup server on port {}", config.port);

    // Initialize cron scheduler
    let scheduler = match BackupScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedule().await {
                tracing::warn!("Failed to initialize schedule: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let app = routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    // Stop scheduler
    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
