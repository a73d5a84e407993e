use std::net::SocketAddr;
use std::sync::Arc;

use omnilake_db::{memory, Database};
use omnilake_inference::OllamaBackend;
use omnilake_jobs::{EngineContext, LakeService, SweepConfig, WorkerConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omnilake_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "omnilake_api=debug,omnilake_jobs=debug,tower_http=debug")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "omnilake_api=debug,omnilake_jobs=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("omnilake-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false)); // no ANSI in files by default
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Console-only output
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    // Get configuration from environment
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .unwrap_or(3000);

    // OMNILAKE_STORAGE=memory runs without PostgreSQL; state is lost on exit.
    let repositories = match std::env::var("OMNILAKE_STORAGE").as_deref() {
        Ok("memory") => {
            warn!("Using in-memory storage; nothing is persisted");
            memory::repositories()
        }
        _ => {
            let database_url = std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/omnilake".to_string());
            let db = Database::connect_with_config(
                &database_url,
                omnilake_db::PoolConfig::from_env(),
            )
            .await?;
            db.migrate().await?;
            info!("Database migrations applied");
            db.repositories()
        }
    };

    let backend = Arc::new(OllamaBackend::from_env());
    info!(base_url = backend.base_url(), "Inference backend configured");
    let service = LakeService::new(EngineContext::new(
        repositories,
        backend.clone(),
        backend,
    ));

    let worker = service.worker(WorkerConfig::from_env()).await.start();
    let sweep = service.sweep(SweepConfig::from_env()).start();

    let app = router(AppState::new(service));

    // Start server
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("Shutting down background processing");
    if let Err(e) = worker.shutdown().await {
        warn!(error = %e, "Event worker did not acknowledge shutdown");
    }
    if let Err(e) = sweep.shutdown().await {
        warn!(error = %e, "Lookup sweep did not acknowledge shutdown");
    }

    Ok(())
}
