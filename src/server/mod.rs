//! Web server: control channel and HTTP API, with JWT authentication

pub mod auth;
pub mod control;
pub mod http;

use anyhow::{Context, Result};
use axum::{middleware, response::Html, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::credits::{self, CreditLedger};
use crate::realtime::{Connector, WsConnector};
use crate::server::auth::{AuthSettings, AuthState};
use crate::session::SessionManager;
use crate::tools::{self, ToolRegistry};

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub auth_state: Arc<AuthState>,
    pub sessions: Arc<SessionManager>,
}

impl ServerState {
    /// Wire the server up from configuration, connecting to the model
    /// with `api_key`
    pub fn from_config(config: Config, api_key: Option<String>) -> Result<Self> {
        let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(&config.realtime, api_key));
        let tools = tools::registry_from_config(&config.tools).context("Failed to build tool registry")?;
        let ledger = credits::ledger_from_config(&config.credits).context("Failed to build credit ledger")?;
        Ok(Self::new(config, connector, tools, ledger))
    }

    pub fn new(config: Config, connector: Arc<dyn Connector>, tools: ToolRegistry, ledger: Arc<dyn CreditLedger>) -> Self {
        let auth_state = AuthState::new(AuthSettings::from(&config.auth));
        let config = Arc::new(config);
        let sessions = Arc::new(SessionManager::new(config.clone(), connector, Arc::new(tools), ledger));
        Self { config, auth_state, sessions }
    }
}

/// All routes
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Protected routes (require JWT auth)
    let protected = Router::new()
        .route("/api/sessions", get(http::sessions_handler))
        .layer(middleware::from_fn_with_state(
            state.auth_state.clone(),
            auth::auth_middleware,
        ));

    // The control channel authenticates in-band (WebSocket can't set headers)
    let public = Router::new()
        .route("/", get(index_page))
        .route("/api/status", get(http::status_handler))
        .route("/ws/conversation", get(control::ws_handler));

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server and run until Ctrl-C
pub async fn start(state: ServerState, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid bind address")?;
    let sessions = state.sessions.clone();

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("     Talkbridge Server Starting");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("✓ Model: {} at {}", state.config.realtime.model, state.config.realtime.endpoint);
    println!("✓ Default capture mode: {}", state.config.capture.mode);
    println!("✓ Tools: {}", state.sessions.tools().len());
    println!("✓ JWT authentication enabled");
    println!();
    println!("🚀 Listening on http://{}", addr);
    println!("   Control channel: ws://{}/ws/conversation", addr);
    println!();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    let ended = sessions.end_all().await;
    info!("Server stopped; {} session(s) ended", ended);
    Ok(())
}

async fn index_page() -> Html<&'static str> {
    Html(r#"<!DOCTYPE html>
<html>
<head>
    <title>Talkbridge</title>
    <meta charset="utf-8">
    <style>
        body { font-family: -apple-system, sans-serif; max-width: 760px; margin: 0 auto; padding: 20px; }
        .endpoint { background: #f0f0f0; padding: 8px; margin: 8px 0; border-radius: 4px; font-family: monospace; }
    </style>
</head>
<body>
    <h1>Talkbridge is running</h1>
    <div class="endpoint">GET /api/status - Server status</div>
    <div class="endpoint">GET /api/sessions - Live conversations (Bearer token)</div>
    <div class="endpoint">GET /ws/conversation - Control channel (authenticate in-band)</div>
</body>
</html>"#)
}
