//! Process entrypoint.
//!
//! Exit codes: 0 clean shutdown, 1 invalid configuration, 2 store
//! unreachable, 3 unhandled panic in the serve task.

use snooscope_core::EventBus;
use snooscope_server::{build_state, open_store, router, AppConfig};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "configuration invalid");
            return ExitCode::from(1);
        }
    };

    let bus = EventBus::default();
    let store = match open_store(&config, &bus) {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(%err, path = %config.store_path.display(), "store unreachable");
            return ExitCode::from(2);
        }
    };

    let state = match build_state(&config, store, bus) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(%err, "initialization failed");
            return ExitCode::from(1);
        }
    };

    // a panic inside the serve task must not look like a clean exit
    let serve = tokio::spawn(serve(config, state));
    match serve.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            tracing::error!(%err, "server error");
            ExitCode::from(2)
        }
        Err(join_err) if join_err.is_panic() => {
            tracing::error!("unhandled panic in server task");
            ExitCode::from(3)
        }
        Err(_) => ExitCode::from(3),
    }
}

async fn serve(config: AppConfig, state: snooscope_server::AppState) -> std::io::Result<()> {
    let engine = state.engine.clone();
    let restored = match engine.resume().await {
        Ok(n) => n,
        Err(err) => {
            tracing::warn!(%err, "session resume failed");
            0
        }
    };
    if restored > 0 {
        tracing::info!(restored, "sessions restored from the store");
    }

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(bind = %config.bind, "control API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // drain running sessions before the process goes away
    engine.shutdown().await;
    tracing::info!("clean shutdown");
    Ok(())
}
