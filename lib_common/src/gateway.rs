//! # WebSocket Gateway
//!
//! HTTP surface of the service: `/health` for liveness checks and `/ws` for
//! participants. Each socket gets a task that asks the hub for admission,
//! forwards text frames and pongs to the hub, and writes whatever the hub
//! queues for it back to the peer.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::core::{HubHandle, Outbound};

pub fn router(hub: HubHandle) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(hub)
}

/// Serves the gateway on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, hub: HubHandle, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Gateway listening on ws://{}/ws", addr);
    }
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(hub): State<HubHandle>,
) -> impl IntoResponse {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    ws.on_upgrade(move |socket| handle_socket(socket, hub, addr, origin))
}

async fn handle_socket(socket: WebSocket, hub: HubHandle, addr: SocketAddr, origin: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let id = match hub.admit(addr.ip(), origin, tx).await {
        Ok(id) => id,
        Err(reason) => {
            info!("Closing {} without admission: {}", addr, reason);
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                // closed by the hub, or the hub is gone
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => hub.inbound(id, text.as_str().to_owned()),
                Some(Ok(Message::Pong(_))) => hub.pong(id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket error on session {}: {}", id, e);
                    break;
                }
            },
        }
    }

    hub.closed(id);
}
