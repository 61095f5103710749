use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use hyperf_core::ConnectionId;
use hyperf_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ack::{self, AckError, AckReceiver};
use crate::config::ServerConfig;
use crate::connection::{start_cleanup_task, ConnectionRegistry};
use crate::dispatcher::{Dispatcher, InboundEvent};
use crate::error::ServerError;
use crate::gateway::Gateway;
use crate::protocol::parse_inbound;
use crate::registry::ControllerRegistry;
use crate::session::SessionStore;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub gateway: Gateway,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind the listener and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    registry: ControllerRegistry,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, ServerError> {
    let connections = Arc::new(
        ConnectionRegistry::new(config.max_send_queue).with_client_timeout(config.client_timeout()),
    );
    let gateway = Gateway::new(Arc::clone(&connections));
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(SessionStore::new()),
            gateway.clone(),
            metrics,
        )
        .with_queue_capacity(config.max_event_queue),
    );

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let cleanup = start_cleanup_task(Arc::clone(&connections), config.heartbeat_interval());
    let shutdown = CancellationToken::new();
    let state = AppState {
        dispatcher: Arc::clone(&dispatcher),
        gateway,
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    };
    let router = build_router(state);

    tracing::info!(
        addr = %local_addr,
        events = ?dispatcher.registry().events(),
        "hyperf server started"
    );

    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        local_addr,
        dispatcher,
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Close every socket, stop accepting and wait for the listener to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.cleanup.abort();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
        tracing::info!("hyperf server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one WebSocket connection from upgrade through disconnect.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, mut rx) = state.gateway.connections().register();
    tracing::info!(connection_id = %connection_id, "websocket client connected");
    state.dispatcher.on_connect(&connection_id);

    let (mut ws_tx, ws_rx) = socket.split();

    // Writer: forward queued frames to the socket and ping periodically.
    let heartbeat = state.config.heartbeat_interval();
    let writer_cid = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_cid, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    tokio::select! {
        _ = &mut writer => {},
        () = read_frames(ws_rx, &connection_id, &state) => {},
        () = state.shutdown.cancelled() => {},
    }
    writer.abort();

    state.gateway.connections().unregister(&connection_id);
    state.dispatcher.disconnect(&connection_id).await;
    tracing::info!(connection_id = %connection_id, "websocket client disconnected");
}

async fn read_frames(mut ws_rx: SplitStream<WebSocket>, connection_id: &ConnectionId, state: &AppState) {
    let connections = state.gateway.connections();
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "socket read failed");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                connections.record_activity(connection_id);
                handle_text(state, connection_id, text.as_str()).await;
            }
            WsMessage::Pong(_) | WsMessage::Ping(_) => connections.record_activity(connection_id),
            WsMessage::Binary(data) => {
                tracing::debug!(connection_id = %connection_id, len = data.len(), "ignoring binary frame");
            }
            WsMessage::Close(_) => break,
        }
    }
}

/// Turn one text frame into a queued event. Waits while the connection's
/// event queue is full, so the socket is not read any further until it drains.
async fn handle_text(state: &AppState, connection_id: &ConnectionId, text: &str) {
    let frame = match parse_inbound(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "invalid frame");
            state.gateway.send_error(connection_id, "invalid frame");
            return;
        }
    };

    let mut inbound = InboundEvent::new(frame.event, frame.data);
    if let Some(ack_id) = frame.ack_id {
        let (handle, rx) = ack::channel();
        inbound = inbound.with_ack(handle);
        spawn_ack_waiter(
            state.gateway.clone(),
            connection_id.clone(),
            ack_id,
            rx,
            state.config.ack_timeout(),
        );
    }
    state.dispatcher.on_event(connection_id, inbound).await;
}

/// Deliver the acknowledgment for `ack_id` once the dispatcher answers it.
fn spawn_ack_waiter(
    gateway: Gateway,
    connection_id: ConnectionId,
    ack_id: u64,
    rx: AckReceiver,
    timeout: Duration,
) {
    tokio::spawn(async move {
        match rx.wait(timeout).await {
            Ok(response) => {
                if !gateway.send_ack(&connection_id, ack_id, &response) {
                    tracing::debug!(connection_id = %connection_id, ack_id, "ack dropped, connection gone");
                }
            }
            Err(AckError::TimedOut(after)) => {
                tracing::warn!(connection_id = %connection_id, ack_id, ?after, "ack timed out");
            }
            Err(AckError::Discarded) => {
                tracing::debug!(connection_id = %connection_id, ack_id, "ack discarded");
            }
        }
    });
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.gateway.connection_count(),
        "events": state.dispatcher.registry().events(),
        "metrics": state.dispatcher.metrics().snapshot(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0, // Random port
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(test_config(), ControllerRegistry::new(), Arc::new(MetricsRecorder::new()))
            .await
            .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        assert!(body["events"].as_array().unwrap().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = start(test_config(), ControllerRegistry::new(), Arc::new(MetricsRecorder::new()))
            .await
            .unwrap();
        let taken = ServerConfig {
            port: first.port,
            ..Default::default()
        };
        let err = start(taken, ControllerRegistry::new(), Arc::new(MetricsRecorder::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn build_router_creates_routes() {
        let connections = Arc::new(ConnectionRegistry::new(32));
        let gateway = Gateway::new(connections);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ControllerRegistry::new()),
            Arc::new(SessionStore::new()),
            gateway.clone(),
            Arc::new(MetricsRecorder::new()),
        ));
        let state = AppState {
            dispatcher,
            gateway,
            config: Arc::new(test_config()),
            shutdown: CancellationToken::new(),
        };

        let _router = build_router(state);
    }
}
