//! # Message Dispatcher
//!
//! Fan-out of [`ServerMessage`]s to connected sockets.
//!
//! A broadcast is serialized exactly once; every recipient receives an `Arc`
//! pointer to the same text. Each socket task owns the receiving half of an
//! unbounded channel, so sending never blocks the hub. A send to a socket
//! whose task is already gone is silently dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, trace};

use super::protocol::ServerMessage;
use super::ranklist::SessionId;

/// What a socket task is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-serialized JSON text frame.
    Frame(Arc<str>),
    /// Keepalive ping; the peer should answer with a pong.
    Ping,
    /// Terminate the connection.
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

#[derive(Debug, Default)]
pub struct Dispatcher {
    clients: HashMap<SessionId, OutboundSender>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&mut self, id: SessionId, sender: OutboundSender) {
        self.clients.insert(id, sender);
        info!("Client '{}' registered", id);
    }

    pub fn remove_client(&mut self, id: SessionId) -> Option<OutboundSender> {
        self.clients.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn encode(message: &ServerMessage) -> Option<Arc<str>> {
        match serde_json::to_string(message) {
            Ok(text) => Some(Arc::from(text)),
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                None
            }
        }
    }

    pub fn broadcast(&self, message: &ServerMessage) {
        let Some(frame) = Self::encode(message) else {
            return;
        };
        trace!("Broadcasting to {} clients: {}", self.clients.len(), frame);
        for sender in self.clients.values() {
            let _ = sender.send(Outbound::Frame(Arc::clone(&frame)));
        }
    }

    pub fn unicast(&self, id: SessionId, message: &ServerMessage) {
        let Some(sender) = self.clients.get(&id) else {
            return;
        };
        if let Some(frame) = Self::encode(message) {
            let _ = sender.send(Outbound::Frame(frame));
        }
    }

    pub fn ping(&self, id: SessionId) {
        if let Some(sender) = self.clients.get(&id) {
            let _ = sender.send(Outbound::Ping);
        }
    }

    /// Unregisters the client and tells its socket task to close.
    pub fn close(&mut self, id: SessionId) {
        if let Some(sender) = self.clients.remove(&id) {
            let _ = sender.send(Outbound::Close);
        }
    }
}
