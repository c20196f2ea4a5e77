//! HTTP/WebSocket server for the roomcast daemon.
//!
//! The server:
//! - Serves health endpoints and an HTTP push endpoint for the relay
//! - Upgrades configured relay paths according to their role
//! - Treats every other path as a room and joins it before upgrading
//! - Optionally restricts relay upgrades to one `Origin`
//! - Supports graceful shutdown via CancellationToken
//! - Tracks upgraded connections so shutdown can wait for their goodbyes
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐
//! │  RoomcastServer   │
//! │   axum::Router    │
//! └─────────┬─────────┘
//!           │ upgrade
//!     ┌─────┴───────────────────┐
//!     ▼                         ▼
//! ┌──────────────────┐   ┌──────────────────┐
//! │ MemberConnection │   │ RelayConnection  │
//! │  (room = path)   │   │ (endpoint role)  │
//! └────────┬─────────┘   └────────┬─────────┘
//!          ▼                      ▼
//! ┌──────────────────┐   ┌──────────────────┐
//! │   BrokerHandle   │   │   RelayHandle    │
//! └──────────────────┘   └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - Connection tasks run under `catch_unwind`; a panic ends one connection

mod connection;
mod pump;
mod relay;

pub use connection::MemberConnection;
pub use pump::{
    from_frame, read_frames, to_frame, write_frames, ConnectionError, Farewell, FrameKind, ReadEnd,
    WRITE_TIMEOUT,
};
pub use relay::{spawn_stream_consumer, RelayConnection, RelayEndpoint, STREAM_HANDOFF_TIMEOUT};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use roomcast_core::{Config, ConfigError, ConnectionId, RoomName};

use crate::broker::BrokerHandle;
use crate::relay::{InboundStream, RelayHandle};
use crate::sink::outbound_channel;

/// Body returned when a request cannot be upgraded.
pub const UPGRADE_FAILED: &str = "Could not upgrade to websocket";

/// Buffer of pending inbound streams per relay endpoint.
const STREAM_BUFFER: usize = 16;

/// Shared state for non-relay routes.
#[derive(Clone)]
struct AppState {
    broker: BrokerHandle,
    relay: RelayHandle,
    shutdown: CancellationToken,
    outbound_capacity: usize,
    started_at: DateTime<Utc>,
    connections: TaskTracker,
}

/// State of one relay endpoint route.
#[derive(Clone)]
struct RelayRoute {
    endpoint: RelayEndpoint,
    allowed_origin: Option<String>,
    connections: TaskTracker,
}

/// The roomcast HTTP/WebSocket server.
pub struct RoomcastServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Config,
    broker: BrokerHandle,
    relay: RelayHandle,
    cancel_token: CancellationToken,
    connections: TaskTracker,

    /// Senders for each inbound-capable endpoint, cloned into the router.
    stream_senders: HashMap<String, mpsc::Sender<InboundStream>>,
    /// Receivers not yet claimed by the application.
    stream_receivers: HashMap<String, mpsc::Receiver<InboundStream>>,
}

impl RoomcastServer {
    /// Binds the configured listen address.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` if the listen address does not parse
    /// - `ServerError::Bind` if the socket cannot be bound
    pub async fn bind(
        config: Config,
        broker: BrokerHandle,
        relay: RelayHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr,
            error: e.to_string(),
        })?;

        let mut stream_senders = HashMap::new();
        let mut stream_receivers = HashMap::new();
        for endpoint in config.relay.endpoints.iter().filter(|e| e.role.receives()) {
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            stream_senders.insert(endpoint.path.clone(), tx);
            stream_receivers.insert(endpoint.path.clone(), rx);
        }

        Ok(Self {
            listener,
            local_addr,
            config,
            broker,
            relay,
            cancel_token,
            connections: TaskTracker::new(),
            stream_senders,
            stream_receivers,
        })
    }

    /// Address actually bound (useful when listening on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tracker of upgraded room and relay connections.
    ///
    /// `run` closes it once the listener stops, so `wait()` completes when
    /// the last connection has said goodbye.
    pub fn connections(&self) -> TaskTracker {
        self.connections.clone()
    }

    /// Claims the inbound streams of a receiving relay endpoint.
    ///
    /// Unclaimed endpoints get a default consumer when the server runs.
    pub fn take_inbound_streams(&mut self, path: &str) -> Option<mpsc::Receiver<InboundStream>> {
        self.stream_receivers.remove(path)
    }

    /// Builds the router.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            relay: self.relay.clone(),
            shutdown: self.cancel_token.clone(),
            outbound_capacity: self.config.broker.outbound_capacity,
            started_at: Utc::now(),
            connections: self.connections.clone(),
        };

        let mut router = Router::new()
            .route("/liveness", get(liveness))
            .route("/readiness", get(readiness))
            .route("/push/{*path}", post(push));

        for endpoint in &self.config.relay.endpoints {
            let route = RelayRoute {
                endpoint: RelayEndpoint {
                    path: endpoint.path.clone(),
                    role: endpoint.role,
                    relay: self.relay.clone(),
                    streams: self.stream_senders.get(&endpoint.path).cloned(),
                    outbound_capacity: self.config.relay.outbound_capacity,
                    inbound_capacity: self.config.relay.inbound_capacity,
                },
                allowed_origin: self.config.relay.allowed_origin.clone(),
                connections: self.connections.clone(),
            };
            router = router.route(&endpoint.path, get(relay_upgrade).with_state(route));
        }

        router.fallback(room_upgrade).with_state(state)
    }

    /// Runs the server until the cancellation token is triggered.
    ///
    /// In-flight HTTP requests finish; upgraded connections end when the
    /// broker and relay close their sinks. Wait on `connections()` to see
    /// them through.
    pub async fn run(mut self) -> Result<(), ServerError> {
        for (path, streams) in self.stream_receivers.drain() {
            let forward_to = self
                .config
                .relay
                .endpoints
                .iter()
                .find(|e| e.path == path)
                .and_then(|e| e.forward_to.clone());
            debug!(path = %path, forward_to = ?forward_to, "Default inbound consumer");
            spawn_stream_consumer(streams, forward_to, self.relay.clone());
        }

        let router = self.router();
        // Only the router keeps stream senders alive from here on.
        self.stream_senders.clear();

        info!(addr = %self.local_addr, "Server listening");

        let cancel = self.cancel_token.clone();
        let served = axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| ServerError::Serve(e.to_string()));
        self.connections.close();
        served?;

        info!(
            open_connections = self.connections.len(),
            "Server stopped accepting connections"
        );
        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Response {
    let ready =
        !state.shutdown.is_cancelled() && state.broker.is_accepting() && !state.relay.is_stopped();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if ready { "ready" } else { "shutting_down" },
        "started_at": state.started_at.to_rfc3339(),
    });
    (status, Json(body)).into_response()
}

async fn push(State(state): State<AppState>, Path(path): Path<String>, body: Bytes) -> StatusCode {
    if state.shutdown.is_cancelled() || state.relay.is_stopped() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    let target = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };
    debug!(path = %target, bytes = body.len(), "HTTP push");
    state.relay.push(body.to_vec(), &target);
    StatusCode::ACCEPTED
}

async fn room_upgrade(
    State(state): State<AppState>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(path = %uri.path(), error = %rejection, "Rejected non-websocket request");
            return (StatusCode::INTERNAL_SERVER_ERROR, UPGRADE_FAILED).into_response();
        }
    };

    let room = match RoomName::from_path(uri.path()) {
        Ok(room) => room,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let id = ConnectionId::next();
    debug!(connection_id = %id, room = %room, "Received connection");

    let (outbound, outbound_rx) = outbound_channel(state.outbound_capacity);
    let inbound = match state.broker.join(room.clone(), id, outbound).await {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(connection_id = %id, room = %room, error = %e, "Join refused");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let connection =
        MemberConnection::new(id, room.clone(), inbound, outbound_rx, state.broker.clone());
    let broker = state.broker;
    let connections = state.connections;

    ws.on_failed_upgrade(move |e| {
        warn!(connection_id = %id, room = %room, error = %e, "Upgrade failed after join");
        broker.leave(room, id);
    })
    .on_upgrade(move |socket| {
        connections.track_future(async move {
            if AssertUnwindSafe(connection.run(socket))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(connection_id = %id, "Member connection panicked");
            }
        })
    })
}

async fn relay_upgrade(
    State(route): State<RelayRoute>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let RelayRoute {
        endpoint,
        allowed_origin,
        connections,
    } = route;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(path = %endpoint.path, error = %rejection, "Rejected non-websocket request");
            return (StatusCode::INTERNAL_SERVER_ERROR, UPGRADE_FAILED).into_response();
        }
    };

    if let Some(allowed) = &allowed_origin {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        if origin != Some(allowed.as_str()) {
            warn!(path = %endpoint.path, origin = ?origin, "Relay origin refused");
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    if endpoint.relay.is_stopped() {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down").into_response();
    }

    let id = ConnectionId::next();
    let connection = RelayConnection::new(id, endpoint);

    ws.on_upgrade(move |socket| {
        connections.track_future(async move {
            if AssertUnwindSafe(connection.run(socket))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(connection_id = %id, "Relay connection panicked");
            }
        })
    })
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Server error: {0}")]
    Serve(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            error: "address in use".to_string(),
        };
        assert!(err.to_string().contains("127.0.0.1:8080"));
        assert!(err.to_string().contains("address in use"));
    }

    #[tokio::test]
    async fn test_router_builds_for_validated_endpoints() {
        let config = Config::from_toml_str(
            r#"
            listen = "127.0.0.1:0"

            [[relay.endpoints]]
            path = "/feed:v2"
            role = "outbound"

            [[relay.endpoints]]
            path = "/ingest/a*b"
            role = "duplex"
            "#,
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        let broker = crate::broker::spawn_broker(&config.broker, shutdown.clone());
        let relay = crate::relay::spawn_relay(&config.relay, shutdown.clone());
        let server = RoomcastServer::bind(config, broker, relay, shutdown.clone())
            .await
            .unwrap();

        let _router = server.router();
        shutdown.cancel();
    }

    #[test]
    fn test_upgrade_failed_text() {
        assert_eq!(UPGRADE_FAILED, "Could not upgrade to websocket");
    }
}
