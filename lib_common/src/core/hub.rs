//! # Hub
//!
//! Serializes every state change through one task. Socket tasks talk to the
//! hub through a cloneable [`HubHandle`]; the hub owns the [`Engine`] and
//! drives the periodic keepalive and save rounds alongside client events.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::dispatcher::OutboundSender;
use super::engine::{Engine, Rejection};
use super::persistence::BlobStore;
use super::ranklist::SessionId;
use crate::configs::Config;

#[derive(Debug)]
pub enum HubEvent {
    Admit {
        identity: IpAddr,
        origin: Option<String>,
        sender: OutboundSender,
        reply: oneshot::Sender<Result<SessionId, Rejection>>,
    },
    Inbound {
        id: SessionId,
        text: String,
    },
    Pong {
        id: SessionId,
    },
    Closed {
        id: SessionId,
    },
    /// An idle timer fired. Ignored unless `generation` is still armed.
    IdleExpired {
        id: SessionId,
        generation: u64,
    },
}

#[derive(Debug, Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
}

impl HubHandle {
    /// Asks the hub to admit a new connection.
    pub async fn admit(
        &self,
        identity: IpAddr,
        origin: Option<String>,
        sender: OutboundSender,
    ) -> Result<SessionId, Rejection> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(HubEvent::Admit {
                identity,
                origin,
                sender,
                reply,
            })
            .map_err(|_| Rejection::ShuttingDown)?;
        response.await.map_err(|_| Rejection::ShuttingDown)?
    }

    pub fn inbound(&self, id: SessionId, text: String) {
        let _ = self.events.send(HubEvent::Inbound { id, text });
    }

    pub fn pong(&self, id: SessionId) {
        let _ = self.events.send(HubEvent::Pong { id });
    }

    pub fn closed(&self, id: SessionId) {
        let _ = self.events.send(HubEvent::Closed { id });
    }
}

pub struct Hub {
    engine: Engine,
    events: mpsc::UnboundedReceiver<HubEvent>,
}

impl Hub {
    pub fn new(config: Config, store: Arc<dyn BlobStore>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(config, store, tx.clone());
        (Self { engine, events: rx }, HubHandle { events: tx })
    }

    /// Runs until `shutdown` resolves, then saves both documents one last time.
    pub async fn run<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let prune_every = self.engine.config().prune_interval;
        let save_every = self.engine.config().save_interval;
        let mut prune = interval_at(Instant::now() + prune_every, prune_every);
        let mut save = interval_at(Instant::now() + save_every, save_every);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Hub started (prune every {:?}, save every {:?})",
            prune_every, save_every
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Hub shutting down");
                    break;
                }
                Some(event) = self.events.recv() => {
                    self.engine.handle(event, Instant::now());
                }
                _ = prune.tick() => {
                    debug!("Keepalive round over {} connections", self.engine.connection_count());
                    self.engine.heartbeat(Instant::now());
                }
                _ = save.tick() => {
                    self.engine.flush();
                }
            }
        }

        self.engine.final_flush();
    }
}
