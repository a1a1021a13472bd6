use axum::routing::get;
use axum::{Json, Router};
use dotenv::dotenv;
use gatekeeper::gatekeeper::middleware::protect;
use gatekeeper::{logging, Gatekeeper, GatekeeperConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_ADDR: &str = "0.0.0.0:3000";

fn load_config() -> gatekeeper::Result<GatekeeperConfig> {
    let mut config = match std::env::var("GATEKEEPER_CONFIG") {
        Ok(path) => GatekeeperConfig::from_file(path)?,
        Err(_) => {
            info!("GATEKEEPER_CONFIG not set, starting without endpoint rules");
            GatekeeperConfig::default()
        }
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn echo(uri: axum::http::Uri) -> Json<Value> {
    Json(json!({ "success": true, "path": uri.path() }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    logging::init_from_env();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid rate limit configuration");
            std::process::exit(1);
        }
    };

    let gatekeeper = match Gatekeeper::from_config(config).await {
        Ok(gatekeeper) => Arc::new(gatekeeper),
        Err(e) => {
            error!(error = %e, "Failed to build gatekeeper");
            std::process::exit(1);
        }
    };

    let api = Router::new().route("/api/{*rest}", get(echo).post(echo));
    let app = protect(api, gatekeeper).route("/health", get(health));

    let addr = std::env::var("GATEKEEPER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "Gatekeeper listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    if let Err(e) = served {
        error!(error = %e, "Server error");
    }
    info!("Gatekeeper stopped");
}
