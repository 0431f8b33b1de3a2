//! HTTP/WebSocket surface and wiring of the relay's components.

pub mod connection;
pub mod publisher;
pub mod spider;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::acl::{Acl, AclError};
use crate::config::{Config, SpiderMode};
use crate::event::envelope::MAX_SUB_ID_LEN;
use crate::event::Event;
use crate::identity::RelayIdentity;
use crate::store::{Store, StoreError};

use self::publisher::{Publisher, MAX_SUBS_PER_CONN};

/// Error types for relay startup and serving.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Acl(#[from] AclError),
}

/// Process-wide wiring shared by every connection and background task.
pub struct RelayState {
    pub cfg: Config,
    pub store: Arc<Store>,
    pub acl: Arc<Acl>,
    pub publisher: Arc<Publisher>,
    pub admit_tx: mpsc::Sender<Event>,
    pub identity: RelayIdentity,
}

/// Open the store under the configured data directory and wire the state.
/// Must run inside a tokio runtime; the publisher fan-out task starts here.
pub fn build(cfg: Config) -> Result<Arc<RelayState>, RelayError> {
    let store = Arc::new(Store::open(&cfg.data_dir)?);
    build_with_store(cfg, store)
}

/// Wire the state over an already opened store.
pub fn build_with_store(cfg: Config, store: Arc<Store>) -> Result<Arc<RelayState>, RelayError> {
    let identity = RelayIdentity::load_or_create(&store)?;
    let acl = Arc::new(Acl::new(cfg.acl_mode, cfg.admins.clone(), &store)?);
    let publisher = Arc::new(Publisher::new(acl.clone()));
    let admit_tx = publisher.start();
    Ok(Arc::new(RelayState {
        cfg,
        store,
        acl,
        publisher,
        admit_tx,
        identity,
    }))
}

/// The main router: WebSocket upgrade and relay-info on `/`, `/healthz`.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind listeners, start background tasks and serve until shutdown.
pub async fn run(cfg: Config) -> Result<(), RelayError> {
    let state = build(cfg)?;
    let addr = format!("{}:{}", state.cfg.listen, state.cfg.port);
    let listener = TcpListener::bind(&addr).await?;

    if let Some(port) = state.cfg.health_port {
        let health = TcpListener::bind(format!("{}:{}", state.cfg.listen, port)).await?;
        tokio::spawn(health_server(health));
    }
    if state.cfg.spider_mode == SpiderMode::Follows {
        tokio::spawn(spider::run(state.clone()));
    }

    serve(state, listener).await
}

/// Serve the relay on an already bound listener until ctrl-c.
pub async fn serve(state: Arc<RelayState>, listener: TcpListener) -> Result<(), RelayError> {
    info!(addr = %listener.local_addr()?, "relay listening");
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "shutdown signal listener failed");
    }
}

async fn health_server(listener: TcpListener) {
    let app = Router::new().route("/healthz", get(healthz));
    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!(error = %e, "health listener failed");
    }
}

async fn root(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    if !ip_allowed(&state.cfg.ip_whitelist, &remote) {
        return (StatusCode::FORBIDDEN, "blocked: address not allowed").into_response();
    }
    if let Some(ws) = ws {
        return ws
            .on_upgrade(move |socket| connection::serve(socket, remote, state))
            .into_response();
    }
    if wants_relay_info(&headers) {
        return Json(info_document(&state)).into_response();
    }
    (
        StatusCode::OK,
        format!("{}: a Nostr relay, connect with a WebSocket client", state.cfg.name),
    )
        .into_response()
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn wants_relay_info(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("application/nostr+json"))
        .unwrap_or(false)
}

/// NIP-11 relay information document.
fn info_document(state: &RelayState) -> Value {
    json!({
        "name": state.cfg.name,
        "description": state.cfg.description,
        "pubkey": state.identity.pubkey_hex(),
        "software": "lorelay",
        "version": env!("CARGO_PKG_VERSION"),
        "supported_nips": [1, 9, 11, 42, 50],
        "limitation": {
            "max_subid_length": MAX_SUB_ID_LEN,
            "max_subscriptions": MAX_SUBS_PER_CONN,
            "auth_required": state.acl.requires_auth(),
            "payment_required": false,
        },
    })
}

fn ip_allowed(whitelist: &[String], remote: &SocketAddr) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let ip = remote.ip().to_string();
    whitelist.iter().any(|prefix| ip.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_allowed() {
        let remote: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(ip_allowed(&[], &remote));
        assert!(ip_allowed(&["127.0.".to_string()], &remote));
        assert!(ip_allowed(
            &["10.0.".to_string(), "127.0.0.1".to_string()],
            &remote
        ));
        assert!(!ip_allowed(&["10.0.".to_string()], &remote));
    }

    #[tokio::test]
    async fn test_info_document_shape() {
        let store = Arc::new(Store::builder().temp(true).build().unwrap());
        let state = build_with_store(Config::default(), store).unwrap();
        let doc = info_document(&state);
        assert_eq!(doc["name"], "lorelay");
        assert_eq!(doc["software"], "lorelay");
        assert_eq!(doc["limitation"]["auth_required"], false);
        assert_eq!(doc["pubkey"].as_str().unwrap().len(), 64);
        assert!(doc["supported_nips"]
            .as_array()
            .unwrap()
            .contains(&json!(42)));
    }
}
