use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::AppState;
use pvfll_core::{BoxStatus, CoreConfig};

/// Main entry point for the pvfll application
///
/// Resolves configuration once, reports what the boxes currently hold, then serves the REST
/// API (with Swagger UI and the SSE event stream) until Ctrl-C or SIGTERM.
///
/// # Environment Variables
/// - `PVFLL_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `PVFLL_STORE_BACKEND`: `s3` (default), `local` or `memory`
/// - `AWS_BUCKET_NAME`, `AWS_REGION`: S3 backend settings
/// - `PVFLL_DATA_DIR`: root directory for the local backend
/// - `PUSHER_APP_ID`, `PUSHER_KEY`, `PUSHER_SECRET`, `PUSHER_CLUSTER`: optional event forwarding
///
/// # Returns
/// * `Ok(())` - If the server starts, runs and shuts down cleanly
/// * `Err(anyhow::Error)` - If configuration, startup or serving fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pvfll_run=info".parse()?)
                .add_directive("pvfll_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("PVFLL_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let cfg = Arc::new(CoreConfig::from_env()?);
    let state = AppState::from_config(cfg)?;

    match state.garden().garden().await {
        Ok(boxes) => {
            let occupied = boxes
                .iter()
                .filter(|(_, status)| matches!(status, BoxStatus::Occupied { .. }))
                .count();
            tracing::info!(occupied, "garden reachable");
        }
        Err(e) => tracing::warn!(error = %e, "garden not reachable at startup"),
    }

    tracing::info!("++ Starting pvfll REST on {}", rest_addr);

    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, api_rest::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("-- pvfll stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
