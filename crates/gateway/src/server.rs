use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    tower_http::cors::{Any, CorsLayer},
    tracing::{info, warn},
};

use {
    wagate_config::{ConnectorKind, WagateConfig, WhatsAppConfig},
    wagate_whatsapp::{
        BridgeConnector, ConnectionManager, Connector, JidFormat, NativeConnector,
        ReconnectPolicy, SessionStore, StatusBroadcaster,
    },
};

use crate::{http, state::GatewayState, ws::handle_connection};

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/send-message", post(http::send_message))
        .route("/send-group-message", post(http::send_group_message))
        .route("/session/restart", post(http::restart_session))
        .layer(cors)
        .with_state(state)
}

/// Pick the network client named by `whatsapp.connector`, along with a
/// description for the startup banner.
fn build_connector(
    config: &WhatsAppConfig,
    store: &Arc<SessionStore>,
) -> anyhow::Result<(Arc<dyn Connector>, String)> {
    match config.connector {
        ConnectorKind::Native => Ok((
            Arc::new(NativeConnector::new(Arc::clone(store), &config.native)),
            "native (in process)".into(),
        )),
        ConnectorKind::Bridge => {
            let command = &config.bridge.command;
            let path = which::which(command)
                .map_err(|e| anyhow::anyhow!("bridge command `{command}` not found: {e}"))?;
            Ok((
                Arc::new(BridgeConnector::new(&config.bridge)),
                format!("bridge ({})", path.display()),
            ))
        },
    }
}

/// Open the session store, start the WhatsApp connection and serve HTTP +
/// WebSocket until interrupted.
pub async fn start_gateway(config: WagateConfig) -> anyhow::Result<()> {
    let session_dir = config.whatsapp.session_path();
    let store = Arc::new(SessionStore::open(&session_dir)?);
    let paired = store.has_session();

    let broadcaster = Arc::new(StatusBroadcaster::new());
    let (connector, connector_name) = build_connector(&config.whatsapp, &store)?;
    let policy = ReconnectPolicy::from(&config.whatsapp.reconnect);
    let manager = ConnectionManager::new(connector, store, Arc::clone(&broadcaster), policy);

    let state = GatewayState::new(
        Arc::clone(&manager),
        broadcaster,
        JidFormat::from(&config.whatsapp),
    );
    let app = build_gateway_app(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("wagate gateway v{}", state.version),
        format!("listening on {addr}"),
        format!(
            "session: {} ({})",
            session_dir.display(),
            if paired { "paired" } else { "not paired" }
        ),
        format!("connector: {connector_name}"),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    if let Err(e) = manager.start().await {
        warn!(error = %e, "initial WhatsApp connection failed, retry scheduled");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.manager.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "phase": snapshot.phase.name(),
        "connected": snapshot.is_connected(),
        "reconnects": state.manager.retries_scheduled(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}
