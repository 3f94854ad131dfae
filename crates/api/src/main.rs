use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use audionorm_core::ffmpeg::ToolCommand;
use audionorm_core::supervisor::ProcessSupervisor;
use audionorm_pipeline::gateway::JobGateway;
use audionorm_pipeline::pool::WorkerPool;
use audionorm_pipeline::{sweeper, PipelineContext};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audionorm_api::app::build_app;
use audionorm_api::config::{LogFormat, ServerConfig};
use audionorm_api::state::AppState;

/// Upper bound on waiting for workers and the sweeper after the server stops.
const PIPELINE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // --- Tracing ---
    init_tracing(config.log_format);
    tracing::info!(
        host = %config.host,
        port = config.port,
        storage = %config.pipeline.storage_root.display(),
        workers = config.pipeline.max_workers,
        "Loaded server configuration",
    );

    // --- Database ---
    let db_path = config.pipeline.storage_root.join(audionorm_db::DATABASE_FILE);
    let db = audionorm_db::create_pool(&db_path)
        .await
        .expect("Failed to open job database");
    tracing::info!(path = %db_path.display(), "Database connection pool created");

    audionorm_db::run_migrations(&db)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Pipeline ---
    let tool = ToolCommand::new(&config.ffmpeg_path);
    let supervisor = ProcessSupervisor::new(
        &config.pipeline.storage_root,
        tool,
        config.normalize.clone(),
    );
    let ctx = PipelineContext::new(db, supervisor, config.pipeline.clone());

    // Jobs left running by a previous process are reclaimed before any worker leases.
    sweeper::recover_on_startup(&ctx)
        .await
        .expect("Startup recovery failed");

    let pipeline_cancel = CancellationToken::new();
    let worker_pool = WorkerPool::spawn(ctx.clone(), pipeline_cancel.clone());
    let sweeper_handle = tokio::spawn(sweeper::run(ctx.clone(), pipeline_cancel.clone()));

    // --- App state ---
    let state = AppState {
        gateway: JobGateway::new(ctx),
        config: Arc::new(config.clone()),
    };
    let app = build_app(state).expect("Invalid HTTP configuration");

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, stopping pipeline");

    // In-flight tool processes are killed; their jobs are recovered on next start.
    pipeline_cancel.cancel();
    if tokio::time::timeout(PIPELINE_SHUTDOWN_TIMEOUT, worker_pool.join())
        .await
        .is_err()
    {
        tracing::warn!("Worker pool did not stop in time");
    }
    let _ = tokio::time::timeout(PIPELINE_SHUTDOWN_TIMEOUT, sweeper_handle).await;

    tracing::info!("Graceful shutdown complete");
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "audionorm_api=debug,audionorm_pipeline=debug,audionorm_core=info,tower_http=debug".into()
    });
    let json = format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
