use std::{
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use governor::{Quota, RateLimiter};
use log::{debug, error, info, warn};
use nonzero_ext::*;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::{
    config::ServerConfig,
    identity::IdentityVerifier,
    lobby::{GraceTicket, Registry},
    storage::GameStore,
};

use super::{
    dispatch,
    protocol::{ErrorCode, ServerMessage},
    Connection, Outbound, Session,
};

const DEFAULT_MESSAGES_PER_SECOND: NonZeroU32 = nonzero!(20u32);

type InboundLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
    governor::middleware::NoOpMiddleware,
>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Server error: {0}")]
    Server(String),
}

/// Shared by every socket task and background sweep
#[derive(Clone)]
pub struct AppState {
    registry: Arc<Mutex<Registry>>,
    config: Arc<ServerConfig>,
    next_connection: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(registry: Registry, config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
            config: Arc::new(config),
            next_connection: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Run the gateway until ctrl-c
pub async fn serve(
    config: ServerConfig,
    store: Arc<dyn GameStore>,
    identity: Arc<dyn IdentityVerifier>,
) -> Result<(), GatewayError> {
    let (registry, expired) = Registry::new(store, identity, config.disconnect_grace);
    let bind = config.bind;
    let state = AppState::new(registry, config);
    spawn_background_tasks(&state, expired);

    let server = axum::Server::try_bind(&bind)
        .map_err(|e| GatewayError::Server(format!("cannot bind {bind}: {e}")))?
        .serve(router(state).into_make_service());
    info!("Listening on {}", server.local_addr());

    server
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await
        .map_err(|e| GatewayError::Server(e.to_string()))
}

// ===== Background sweeps =====

fn spawn_background_tasks(state: &AppState, mut expired: mpsc::UnboundedReceiver<GraceTicket>) {
    let registry = state.registry.clone();
    tokio::spawn(async move {
        while let Some(ticket) = expired.recv().await {
            registry.lock().await.expire_grace(&ticket);
        }
    });

    let registry = state.registry.clone();
    let (ping_interval, pong_grace) = (state.config.ping_interval, state.config.pong_grace);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            let closed = registry
                .lock()
                .await
                .liveness_sweep(Instant::now(), pong_grace);
            if closed > 0 {
                info!("Liveness sweep closed {} connections", closed);
            }
        }
    });

    let registry = state.registry.clone();
    let (sweep_interval, retention) = (state.config.idle_sweep_interval, state.config.idle_retention);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            registry.lock().await.evict_idle(Instant::now(), retention);
        }
    });
}

// ===== Handlers =====

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry.lock().await;
    Json(json!({
        "status": "ok",
        "lobbies": registry.lobby_count(),
        "participants": registry.participant_count(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn inbound_limiter(per_second: u32) -> InboundLimiter {
    let rate = NonZeroU32::new(per_second).unwrap_or(DEFAULT_MESSAGES_PER_SECOND);
    RateLimiter::direct(Quota::per_second(rate))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = state.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut session = Session::new(Connection::new(id, tx));
    let limiter = inbound_limiter(state.config.messages_per_second);
    let (mut sink, mut stream) = socket.split();
    debug!("Connection {} opened", id);

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode {:?}: {}", message, e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!("Close frame not delivered: {}", e);
                    }
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if limiter.check().is_err() {
                        warn!("Connection {} is over its message rate", id);
                        session.connection.send(ServerMessage::error(
                            ErrorCode::RateLimited,
                            "too many messages",
                        ));
                        continue;
                    }
                    let mut registry = state.registry.lock().await;
                    dispatch(&mut registry, &mut session, &text);
                }
                Some(Ok(Message::Binary(_))) => {
                    session.connection.send(ServerMessage::error(
                        ErrorCode::InvalidPayload,
                        "binary frames are not supported",
                    ));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Connection {} read error: {}", id, e);
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    if let Some(pid) = &session.participant {
        if let Some(ticket) = state.registry.lock().await.disconnect(pid, id) {
            debug!("Seat of {} held under grace timer #{}", pid, ticket.generation);
        }
    }
    writer.abort();
    debug!("Connection {} closed", id);
}
