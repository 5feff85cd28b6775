use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use netlens_core::Envelope;

use crate::client::{self, ClientId, ClientRegistry};

const EVENT_QUEUE: usize = 1024;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub host: String,
    /// Port to bind; 0 picks a free one.
    pub port: u16,
    /// Per-viewer send queue depth.
    pub max_send_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9090,
            max_send_queue: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub is already running")]
    AlreadyRunning,
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

/// Connection lifecycle notifications fanned out to subscribers.
#[derive(Clone, Debug)]
pub enum HubEvent {
    Connected(ClientId),
    Disconnected(ClientId),
    Message(ClientId, String),
}

/// Fan-out list for hub events. Every subscriber sees every event; a full
/// or dropped subscriber is skipped without affecting the others.
#[derive(Clone, Default)]
pub struct HubEvents {
    listeners: Arc<Mutex<Vec<mpsc::Sender<HubEvent>>>>,
}

impl HubEvents {
    pub fn subscribe(&self) -> mpsc::Receiver<HubEvent> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        self.listeners.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: HubEvent) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("hub event queue full, dropping event for one subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Owns the set of live viewer connections and the raw message transport.
/// Knows nothing about message semantics.
pub struct ConnectionHub {
    config: HubConfig,
    registry: Arc<ClientRegistry>,
    events: HubEvents,
    running: Mutex<Option<Running>>,
}

struct Running {
    port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

#[derive(Clone)]
struct HubState {
    registry: Arc<ClientRegistry>,
    events: HubEvents,
    started: DateTime<Utc>,
}

impl ConnectionHub {
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(ClientRegistry::new(config.max_send_queue));
        Self {
            config,
            registry,
            events: HubEvents::default(),
            running: Mutex::new(None),
        }
    }

    /// Subscribe to connection lifecycle events. May be called any number of
    /// times; each receiver sees every event.
    pub fn subscribe(&self) -> mpsc::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// The broadcast/targeted-send transport, shareable with upper layers.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the listener and start serving. Returns the bound port.
    pub async fn start(&self) -> Result<u16, HubError> {
        if self.running.lock().is_some() {
            return Err(HubError::AlreadyRunning);
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        let state = HubState {
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            started: Utc::now(),
        };
        let router = build_router(state);

        let shutdown = CancellationToken::new();
        let server_token = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_token.cancelled().await })
                .await
                .ok();
        });
        let cleanup =
            client::start_cleanup_task(Arc::clone(&self.registry), CLEANUP_INTERVAL, shutdown.clone());

        let mut running = self.running.lock();
        if running.is_some() {
            // a concurrent start won while we were binding
            shutdown.cancel();
            return Err(HubError::AlreadyRunning);
        }
        *running = Some(Running {
            port,
            shutdown,
            server,
            _cleanup: cleanup,
        });
        tracing::info!(port, "hub listening");
        Ok(port)
    }

    /// Close every connection and the listener. Idempotent.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.shutdown.cancel();
        self.registry.clear();
        let _ = running.server.await;
        tracing::info!("hub stopped");
    }

    /// Serialize once and queue for every open viewer.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        match envelope.encode() {
            Some(json) => self.registry.broadcast_all(&json),
            None => 0,
        }
    }

    /// Queue a message for exactly one viewer. No-op if unknown or closed.
    pub fn send(&self, client_id: &ClientId, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Some(json) => self.registry.send_to(client_id, json),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|r| r.port)
    }

    pub fn client_count(&self) -> usize {
        self.registry.count()
    }
}

fn build_router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: HubState) {
    let (client_id, rx) = state.registry.register();
    tracing::info!(client_id = %client_id, "viewer connected");

    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        Arc::clone(&state.registry),
        state.events.clone(),
    )
    .await;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    clients: usize,
    started_at: String,
}

async fn health_handler(State(state): State<HubState>) -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok",
        clients: state.registry.count(),
        started_at: state.started.to_rfc3339(),
    })
}
