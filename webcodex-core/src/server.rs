use crate::config::Config;
use crate::liveness::LivenessMonitor;
use crate::ws::{terminal_ws_handler, TerminalSettings, WsState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct ConfigResponse {
    openai: bool,
    debug: bool,
}

pub async fn start_http_server(
    config: Config,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = bind_http_server(config.clone()).await?;
    serve_http_server(config, listener).await
}

fn get_bind_addr(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

pub async fn bind_http_server(
    config: Config,
) -> Result<TcpListener, Box<dyn std::error::Error + Send + Sync>> {
    let bind_addr = get_bind_addr(&config.host, config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("HTTP server bound to {}", bind_addr);
    Ok(listener)
}

pub async fn serve_http_server(
    config: Config,
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    serve_http_server_with_shutdown(config, listener, std::future::pending()).await
}

pub async fn serve_http_server_with_shutdown(
    config: Config,
    listener: TcpListener,
    shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let ws_state = WsState::new(TerminalSettings::from_config(&config));
    info!(
        data_root = %ws_state.terminal.data_root.display(),
        command = %ws_state.terminal.command,
        "Terminal sessions enabled"
    );

    let cancel = CancellationToken::new();
    let monitor = LivenessMonitor::new(ws_state.registry.clone(), config.heartbeat_interval());
    debug!("Heartbeat interval: {:?}", monitor.interval());
    let monitor_task = monitor.spawn(cancel.clone());

    let app = build_router(Arc::new(config), ws_state.clone());

    let shutdown = {
        let ws_state = ws_state.clone();
        let cancel = cancel.clone();
        async move {
            shutdown_signal.await;
            info!("Shutting down");
            cancel.cancel();
            ws_state.clear();
        }
    };

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    cancel.cancel();
    if let Err(e) = monitor_task.await {
        warn!("Liveness monitor task failed: {}", e);
    }

    result?;
    Ok(())
}

pub fn build_router(config: Arc<Config>, ws_state: WsState) -> Router {
    let ws_routes = Router::new()
        .route("/ws/terminal", get(terminal_ws_handler))
        .with_state(ws_state);

    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/config", get(config_handler))
        .with_state(config)
        .merge(ws_routes)
}

async fn root() -> &'static str {
    "webcodex backend is running."
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// Ready when the data root is writable.
async fn readyz(State(config): State<Arc<Config>>) -> impl IntoResponse {
    let probe = config.data_dir.join(".readyz.touch");

    let result = async {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        tokio::fs::write(&probe, "ok").await?;
        tokio::fs::remove_file(&probe).await
    }
    .await;

    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(e) => {
            warn!("Readiness probe failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ok": false, "error": e.to_string() })),
            )
        }
    }
}

async fn config_handler(State(config): State<Arc<Config>>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        openai: config.openai_api_key.is_some(),
        debug: config.debug,
    })
}
