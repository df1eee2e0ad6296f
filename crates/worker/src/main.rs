use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfyjob_comfyui::readiness::wait_until_ready;
use comfyjob_core::job::JobOutput;
use comfyjob_worker::config::WorkerConfig;
use comfyjob_worker::orchestrator::{read_job_file, Orchestrator};
use comfyjob_worker::server::{self, AppState};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "comfyjob_worker=info,comfyjob_comfyui=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().expect("Invalid worker configuration");
    tracing::info!(
        comfy_host = %config.comfy_host,
        lora_dir = %config.lora_dir.display(),
        workflow = ?config.workflow,
        "Loaded worker configuration",
    );
    let config = Arc::new(config);

    // --- Shutdown signal ---
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&config)));

    // --- Readiness gate ---
    if !wait_until_ready(orchestrator.api(), &config.readiness, &shutdown).await {
        tracing::error!("ComfyUI is not ready, refusing to accept jobs");
        std::process::exit(1);
    }

    // --- One-shot mode ---
    if let Some(path) = &config.job_input_file {
        let output = match read_job_file(path).await {
            Ok(job) => orchestrator.handle(&job, &shutdown).await,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot load job file");
                JobOutput::Failure {
                    error: e.to_string(),
                }
            }
        };
        println!(
            "{}",
            serde_json::to_string(&output).expect("Job output is always serializable")
        );
        if !output.is_success() {
            std::process::exit(1);
        }
        return;
    }

    // --- Serve mode ---
    let app = server::router(AppState {
        orchestrator,
        shutdown: shutdown.clone(),
    });

    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting job server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("Server error");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or, on Unix, SIGTERM.
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
