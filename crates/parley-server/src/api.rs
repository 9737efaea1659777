use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::protocol::{ClientFrame, ServerFrame};
use parley_shared::UserId;

use crate::error::ServerError;
use crate::hub::ConnectionHandle;
use crate::session::Session;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
    })
}

/// Identity resolved by the authenticating proxy in front of us.
fn authenticate(headers: &HeaderMap, header: &str) -> Result<UserId, ServerError> {
    let raw = headers
        .get(header)
        .ok_or_else(|| ServerError::Unauthorized("missing identity header".into()))?
        .to_str()
        .map_err(|_| ServerError::Unauthorized("identity header is not valid text".into()))?;
    UserId::parse(raw).map_err(|e| ServerError::Unauthorized(e.to_string()))
}

async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user = match authenticate(&headers, &state.config.identity_header) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| run_connection(state, user, socket)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Drive one WebSocket until either side goes away.
///
/// Three tasks: the writer drains the handle's outbound queue onto the
/// socket, the reader routes acknowledgments straight to the handle and
/// queues requests, and the session task runs the lifecycle and handles
/// queued requests one at a time.
async fn run_connection(state: AppState, user: UserId, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let handle = Arc::new(ConnectionHandle::new(user.clone(), out_tx));
    debug!(user = %user, handle = %handle.id(), "socket accepted");

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<(Option<u64>, serde_json::Value)>();
    let mut recv_task = {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Text(text) => match ClientFrame::from_json(&text) {
                        Ok(ClientFrame::Ack { id, reply }) => handle.resolve_ack(id, reply).await,
                        Ok(ClientFrame::Request { ack, request }) => {
                            if req_tx.send((ack, request)).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(user = %handle.user(), error = %e, "dropping unreadable frame"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        })
    };

    let refresh_every = state
        .config
        .presence_ttl
        .map(|ttl| (ttl / 3).max(Duration::from_secs(1)));

    let mut session_task = tokio::spawn(async move {
        let mut session = match Session::connect(state, handle).await {
            Ok(session) => session,
            Err(e) => {
                warn!(user = %user, error = %e, "connect failed");
                return;
            }
        };

        let mut refresh = refresh_every.map(|period| tokio::time::interval_at(Instant::now() + period, period));
        loop {
            tokio::select! {
                request = req_rx.recv() => match request {
                    Some((ack, request)) => session.dispatch(ack, request).await,
                    None => break,
                },
                _ = next_tick(&mut refresh) => session.refresh_presence().await,
            }
        }
        session.disconnect().await;
    });

    tokio::select! {
        _ = &mut session_task => {}
        _ = &mut send_task => {
            recv_task.abort();
            let _ = session_task.await;
        }
    }
    send_task.abort();
    recv_task.abort();
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP + WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
