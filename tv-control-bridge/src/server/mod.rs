use crate::controller::{CommandError, ControlCommand};
use crate::model::MediaState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};

/// A command from an API client plus the slot its outcome is reported on.
pub struct CommandRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<Result<(), CommandError>>,
}

#[derive(Clone)]
struct ServerState {
    token: String,
    rx: watch::Receiver<MediaState>,
    commands: mpsc::Sender<CommandRequest>,
}

pub async fn start(
    addr: SocketAddr,
    token: String,
    rx: watch::Receiver<MediaState>,
    commands: mpsc::Sender<CommandRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(token, rx, commands);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "api server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

fn router(
    token: String,
    rx: watch::Receiver<MediaState>,
    commands: mpsc::Sender<CommandRequest>,
) -> Router {
    let state = Arc::new(ServerState {
        token,
        rx,
        commands,
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/state", get(get_state))
        .route("/ws", get(ws_handler))
        .route("/command", post(post_command))
        .with_state(state)
}

async fn get_state(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let snapshot = state.rx.borrow().clone();
    (StatusCode::OK, Json(snapshot)).into_response()
}

async fn post_command(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(command): Json<ControlCommand>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let (reply, outcome) = oneshot::channel();
    if state
        .commands
        .send(CommandRequest { command, reply })
        .await
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "controller stopped").into_response();
    }

    match outcome.await {
        Ok(Ok(())) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response(),
        Ok(Err(err)) => {
            let status = if err.is_caller_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::BAD_GATEWAY
            };
            (
                status,
                Json(serde_json::json!({ "status": "error", "error": err.to_string() })),
            )
                .into_response()
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "controller stopped").into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let rx = state.rx.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(mut socket: WebSocket, mut rx: watch::Receiver<MediaState>) {
    let mut pending = true;

    loop {
        if pending {
            let encoded = serde_json::to_string(&*rx.borrow_and_update());
            let payload = match encoded {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot encode state");
                    break;
                }
            };
            if socket.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                pending = true;
            }
            msg = socket.recv() => {
                pending = false;
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    // Authorization: Bearer <token>
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    // Browsers cannot set headers on WebSocket upgrades
    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}
