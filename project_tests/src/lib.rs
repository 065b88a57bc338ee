//! Helpers for driving a live ranked-list server over real sockets.
//!
//! Every client connects from its own loopback address (`127.0.0.x`) so the
//! per-address rules can be exercised from a single machine.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{WebSocketStream, client_async};
use tokio_util::sync::CancellationToken;

use lib_common::{Config, Hub, MemoryStore, gateway};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: MemoryStore,
    stop: CancellationToken,
    hub: JoinHandle<()>,
    gateway: JoinHandle<()>,
}

impl TestServer {
    /// Starts a hub and gateway on an ephemeral port, backed by memory.
    pub async fn start(config: Config) -> Result<Self> {
        let store = MemoryStore::new();
        let (hub, handle) = Hub::new(config, Arc::new(store.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let stop = CancellationToken::new();
        let hub = tokio::spawn(hub.run(stop.clone().cancelled_owned()));
        let gateway_stop = stop.clone().cancelled_owned();
        let gateway = tokio::spawn(async move {
            let _ = gateway::serve(listener, handle, gateway_stop).await;
        });

        Ok(Self {
            addr,
            store,
            stop,
            hub,
            gateway,
        })
    }

    /// Stops accepting, flushes the documents and waits for both tasks.
    pub async fn stop(self) -> Result<()> {
        self.stop.cancel();
        self.hub.await?;
        self.gateway.await?;
        Ok(())
    }
}

pub struct Client {
    pub id: u64,
    /// The `initial` payload.
    pub initial: Value,
    ws: WebSocketStream<TcpStream>,
}

/// Opens a WebSocket to `server` from `source`, optionally sending an Origin header.
pub async fn connect(server: SocketAddr, source: Ipv4Addr, origin: Option<&str>) -> Result<WebSocketStream<TcpStream>> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::from((source, 0)))?;
    let stream = socket.connect(server).await?;

    let mut request = format!("ws://{}/ws", server).into_client_request()?;
    if let Some(origin) = origin {
        request.headers_mut().insert("Origin", HeaderValue::from_str(origin)?);
    }
    let (ws, _) = client_async(request, stream).await?;
    Ok(ws)
}

/// Reads the next JSON text frame. `None` when the server closed the socket.
pub async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Result<Option<Value>> {
    loop {
        let message = timeout(READ_TIMEOUT, ws.next()).await.context("timed out waiting for a frame")?;
        match message {
            Some(Ok(Message::Text(text))) => return Ok(Some(serde_json::from_str(text.as_str())?)),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

impl Client {
    /// Connects and waits for the `initial` payload.
    pub async fn join(server: SocketAddr, source: Ipv4Addr) -> Result<Self> {
        Self::join_with_origin(server, source, None).await
    }

    pub async fn join_with_origin(server: SocketAddr, source: Ipv4Addr, origin: Option<&str>) -> Result<Self> {
        let mut ws = connect(server, source, origin).await?;
        let frame = next_json(&mut ws).await?.ok_or_else(|| anyhow!("closed before initial"))?;
        let initial = frame
            .get("initial")
            .cloned()
            .ok_or_else(|| anyhow!("expected initial, got {}", frame))?;
        let id = initial["id"].as_u64().ok_or_else(|| anyhow!("initial without id"))?;
        Ok(Self { id, initial, ws })
    }

    pub async fn send(&mut self, envelope: Value) -> Result<()> {
        self.ws.send(Message::text(envelope.to_string())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::text(text)).await?;
        Ok(())
    }

    /// Skips frames until one carrying `key`, and returns its value.
    pub async fn expect(&mut self, key: &str) -> Result<Value> {
        loop {
            let frame = next_json(&mut self.ws)
                .await?
                .ok_or_else(|| anyhow!("closed while waiting for {}", key))?;
            if let Some(value) = frame.get(key) {
                return Ok(value.clone());
            }
        }
    }

    /// Reads until `key` has been seen `count` times, returning every value.
    pub async fn collect(&mut self, key: &str, count: usize) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            values.push(self.expect(key).await?);
        }
        Ok(values)
    }

    /// Reads until the server closes the socket.
    pub async fn expect_closed(&mut self) -> Result<()> {
        while next_json(&mut self.ws).await?.is_some() {}
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}

/// `127.0.0.n`
pub fn loopback(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, n)
}
