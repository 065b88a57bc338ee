//! # Ranked-List Engine
//!
//! The single context object owning every piece of shared state: open
//! connections, the admission table, the ban set, the abuse ledger, the ranked
//! list and the discussion log. Only the hub task touches it, one event at a
//! time, so each handler runs to completion before anything else observes the
//! state.
//!
//! ## Voting policy
//!
//! - Voting for one's own item terminates the voter.
//! - Voting for an item owned by another open connection from the same
//!   address also terminates the voter. Neither records a strike.
//! - A connection's votes are spaced by at least `voteCooldown`.
//! - In `threshold` mode an item moves one step each time its vote count
//!   reaches a multiple of `voteThreshold`; in `immediate` mode every
//!   accepted vote moves it one step.
//!
//! ## Abuse heuristics
//!
//! Oversized edits and quick disconnects each strike against a per-address
//! counter; reaching `abuseBanThreshold` on any counter bans the address until
//! the process exits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::abuse::{AbuseLedger, BanSet, Heuristic};
use super::admission::{AdmissionTable, Identity};
use super::commands::{decode_envelope, is_hex_color, sanitize_line, sanitize_word, Command, Privileged};
use super::dispatcher::{Dispatcher, OutboundSender};
use super::hub::HubEvent;
use super::persistence::{BlobStore, Document};
use super::presence::{Counts, Tab};
use super::protocol::{ChatLine, InitialState, ServerMessage};
use super::ranklist::{ItemState, ListItem, RankedList, SessionId, Step};
use super::scheduler::TaskSlot;
use crate::configs::{Config, PromotionMode};

/// Why a candidate connection was refused. The client is never told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("origin mismatch")]
    OriginMismatch,
    #[error("max conns")]
    CapExceeded,
    #[error("banned")]
    Banned,
    #[error("server shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    Unresponsive,
    Idle,
    SelfVote,
    SameAddressVote,
    OversizedEdit,
    Banned,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::ClientClosed => "closed by client",
            CloseReason::Unresponsive => "no pong",
            CloseReason::Idle => "idle",
            CloseReason::SelfVote => "self vote",
            CloseReason::SameAddressVote => "vote from the owner's address",
            CloseReason::OversizedEdit => "oversized edit",
            CloseReason::Banned => "banned",
        };
        f.write_str(text)
    }
}

/// Idle grace for an item with `votes` votes. Saturates at `Duration::MAX`.
pub fn idle_grace(base: Duration, votes: u32) -> Duration {
    base.saturating_mul(votes.max(1))
}

struct Connection {
    identity: Identity,
    connected_at: Instant,
    alive: bool,
    last_vote: Option<Instant>,
    tab: Tab,
    idle: TaskSlot,
}

pub struct Engine {
    config: Config,
    admission: AdmissionTable,
    bans: BanSet,
    abuse: AbuseLedger,
    list: RankedList,
    chat: Document<ChatLine>,
    dispatcher: Dispatcher,
    connections: HashMap<SessionId, Connection>,
    next_session: SessionId,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Engine {
    /// Loads both documents from `store`. `events` receives timer firings.
    pub fn new(config: Config, store: Arc<dyn BlobStore>, events: mpsc::UnboundedSender<HubEvent>) -> Self {
        let list = RankedList::new(Document::load(store.clone(), &config.filename));
        let chat = Document::load(store, &config.chat_filename);
        let next_session = list.max_id().map_or(1, |id| id + 1);

        Self {
            admission: AdmissionTable::new(config.max_conns_per_ip),
            bans: BanSet::new(),
            abuse: AbuseLedger::new(config.abuse_ban_threshold),
            list,
            chat,
            dispatcher: Dispatcher::new(),
            connections: HashMap::new(),
            next_session,
            events,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn items(&self) -> &[ListItem] {
        self.list.items()
    }

    pub fn position(&self, id: SessionId) -> Option<usize> {
        self.list.position(id)
    }

    pub fn chat_lines(&self) -> &[ChatLine] {
        self.chat.items()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, id: SessionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn open_from(&self, identity: &Identity) -> u32 {
        self.admission.count(identity)
    }

    pub fn is_banned(&self, identity: &Identity) -> bool {
        self.bans.is_banned(identity)
    }

    pub fn counts(&self) -> Counts {
        Counts::tally(self.connections.values().map(|c| c.tab))
    }

    fn broadcast_counts(&self) {
        self.dispatcher.broadcast(&ServerMessage::Counts(self.counts()));
    }

    pub fn is_idle_armed(&self, id: SessionId) -> bool {
        self.connections.get(&id).is_some_and(|c| c.idle.is_armed())
    }

    pub fn handle(&mut self, event: HubEvent, now: Instant) {
        match event {
            HubEvent::Admit {
                identity,
                origin,
                sender,
                reply,
            } => {
                let result = self.admit(identity, origin.as_deref(), sender, now);
                if let Err(Ok(id)) = reply.send(result) {
                    // the socket task went away before hearing back
                    self.on_close(id, now);
                }
            }
            HubEvent::Inbound { id, text } => self.on_message(id, &text, now),
            HubEvent::Pong { id } => self.on_pong(id),
            HubEvent::Closed { id } => self.on_close(id, now),
            HubEvent::IdleExpired { id, generation } => self.on_idle_expired(id, generation, now),
        }
    }

    /// Admission checks in order: origin, ban, per-identity cap.
    pub fn admit(
        &mut self,
        identity: Identity,
        origin: Option<&str>,
        sender: OutboundSender,
        now: Instant,
    ) -> Result<SessionId, Rejection> {
        debug!("Verifying {}", identity);
        if let Some(expected) = &self.config.origin {
            if origin != Some(expected.as_str()) {
                info!("Rejected {}: bad origin {:?}", identity, origin);
                return Err(Rejection::OriginMismatch);
            }
        }
        if self.bans.is_banned(&identity) {
            info!("Rejected {}: banned", identity);
            return Err(Rejection::Banned);
        }
        if !self.admission.can_add(&identity) {
            info!("Rejected {}: max conns", identity);
            return Err(Rejection::CapExceeded);
        }

        self.admission.add(identity);
        let id = self.next_session;
        self.next_session += 1;
        self.connections.insert(
            id,
            Connection {
                identity,
                connected_at: now,
                alive: true,
                last_vote: None,
                tab: Tab::default(),
                idle: TaskSlot::new(),
            },
        );
        self.dispatcher.add_client(id, sender);
        info!("Accepted {} as session {}", identity, id);

        let initial = InitialState {
            items: self.list.items().to_vec(),
            id,
            config: self.config.echo(),
            lines: self.chat.items().to_vec(),
        };
        self.dispatcher.unicast(id, &ServerMessage::Initial(initial));
        self.dispatcher.broadcast(&ServerMessage::Joined(self.connections.len()));
        self.broadcast_counts();
        Ok(id)
    }

    pub fn on_message(&mut self, id: SessionId, text: &str, now: Instant) {
        if !self.connections.contains_key(&id) {
            return;
        }
        debug!("Received message from session {}: {}", id, text);

        let commands = match decode_envelope(text) {
            Ok(commands) => commands,
            Err(e) => {
                warn!("Malformed envelope from session {}: {}", id, e);
                return;
            }
        };
        for command in commands {
            // an earlier command may have terminated the sender
            if !self.connections.contains_key(&id) {
                break;
            }
            match command {
                Ok(command) => self.execute(id, command, now),
                Err(e) => warn!("Ignoring command from session {}: {}", id, e),
            }
        }
    }

    fn execute(&mut self, id: SessionId, command: Command, now: Instant) {
        match command {
            Command::Edit(text) => self.edit(id, &text, now),
            Command::Vote(target) => self.vote(id, target, now),
            Command::Color(color) => self.color(id, &color),
            Command::Say(text) => self.say(&text),
            Command::Chat(text) => self.chat(id, &text),
            Command::Tab(tab) => self.switch_tab(id, tab),
            Command::Sudo(privileged) => self.sudo(id, privileged, now),
        }
    }

    fn edit(&mut self, id: SessionId, raw: &str, now: Instant) {
        let text = sanitize_word(raw, self.config.max_text_len);
        if text.is_empty() {
            return;
        }

        match self.list.get(id).map(|item| item.text.chars().count()) {
            Some(old_len) => {
                let new_len = text.chars().count();
                if self.config.anti_abuse && old_len.abs_diff(new_len) > self.config.max_edit_delta {
                    warn!("Session {} edit changed length {} -> {}", id, old_len, new_len);
                    if let Some(identity) = self.connections.get(&id).map(|c| c.identity) {
                        self.strike(identity, Heuristic::OversizedEdit);
                    }
                    self.terminate(id, CloseReason::OversizedEdit, now);
                    return;
                }
                if let Some((_, item)) = self.list.get_mut(id) {
                    item.text = text.clone();
                }
                self.dispatcher.broadcast(&ServerMessage::Update { id, text });
            }
            None => {
                let item = ListItem::new(id, text);
                self.list.push(item.clone());
                self.dispatcher.broadcast(&ServerMessage::Added(item));
            }
        }

        self.arm_idle(id);
        if self.list.is_full(self.config.max_items) {
            self.rollover();
        }
    }

    fn arm_idle(&mut self, id: SessionId) {
        let votes = self.list.get(id).map_or(0, |item| item.votes);
        let delay = idle_grace(self.config.idle_base, votes);
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        let events = self.events.clone();
        connection.idle.schedule(delay, move |generation| async move {
            let _ = events.send(HubEvent::IdleExpired { id, generation });
        });
        debug!("Session {} idle timer set to {:?}", id, delay);
    }

    fn vote(&mut self, id: SessionId, target: SessionId, now: Instant) {
        let Some(index) = self.list.position(target) else {
            return;
        };
        if target == id {
            warn!("Session {} voted for its own item", id);
            self.terminate(id, CloseReason::SelfVote, now);
            return;
        }
        let Some(voter) = self.connections.get(&id) else {
            return;
        };
        let identity = voter.identity;
        if self.connections.get(&target).is_some_and(|owner| owner.identity == identity) {
            warn!("Session {} voted for {} from the same address", id, target);
            self.terminate(id, CloseReason::SameAddressVote, now);
            return;
        }
        if let Some(last) = voter.last_vote {
            if now.saturating_duration_since(last) < self.config.vote_cooldown {
                debug!("Session {} vote rejected: cooldown", id);
                return;
            }
        }

        if let Some(voter) = self.connections.get_mut(&id) {
            voter.last_vote = Some(now);
        }
        let threshold = self.config.vote_threshold;
        let (votes, before) = match self.list.get_mut(target) {
            Some((_, item)) => {
                let before = item.state(threshold);
                item.votes += 1;
                (item.votes, before)
            }
            None => return,
        };
        let step_due = match self.config.promotion_mode {
            PromotionMode::Immediate => true,
            PromotionMode::Threshold => votes % self.config.vote_threshold == 0,
        };
        if step_due {
            match self.list.promote(index) {
                Step::Moved { from } => self.dispatcher.broadcast(&ServerMessage::Moved(from)),
                step => debug!("Item {} did not move: {:?}", target, step),
            }
        }
        self.log_transition(target, before);
    }

    fn log_transition(&self, id: SessionId, before: ItemState) {
        if let Some(after) = self.list.get(id).map(|item| item.state(self.config.vote_threshold)) {
            if after != before {
                info!("Item {} {:?} -> {:?}", id, before, after);
            }
        }
    }

    fn switch_tab(&mut self, id: SessionId, tab: Tab) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        if connection.tab == tab {
            return;
        }
        debug!("Session {} tab {:?} -> {:?}", id, connection.tab, tab);
        connection.tab = tab;
        self.broadcast_counts();
    }

    fn color(&mut self, id: SessionId, color: &str) {
        if !is_hex_color(color) {
            debug!("Session {} sent invalid color {:?}", id, color);
            return;
        }
        if let Some((_, item)) = self.list.get_mut(id) {
            item.color = Some(color.to_string());
            self.dispatcher.broadcast(&ServerMessage::Color {
                id,
                color: color.to_string(),
            });
        }
    }

    fn say(&mut self, raw: &str) {
        let text = sanitize_line(raw, self.config.max_chat_len);
        if !text.is_empty() {
            self.dispatcher.broadcast(&ServerMessage::Announcement(text));
        }
    }

    fn chat(&mut self, id: SessionId, raw: &str) {
        let text = sanitize_line(raw, self.config.max_chat_len);
        if text.is_empty() {
            return;
        }
        let line = ChatLine { text, id };
        self.chat.push_bounded(line.clone(), self.config.max_chat_lines);
        self.dispatcher.broadcast(&ServerMessage::Lines(vec![line]));
    }

    fn sudo(&mut self, id: SessionId, command: Privileged, now: Instant) {
        if !self.config.enable_sudo {
            warn!("Ignoring sudo {:?} from session {}: disabled", command, id);
            return;
        }
        info!("Session {} sudo {:?}", id, command);

        match command {
            Privileged::Admin => {
                if let Some((index, item)) = self.list.get_mut(id) {
                    item.admin = true;
                    self.dispatcher.broadcast(&ServerMessage::Admin(index));
                }
            }
            Privileged::Ban(target) => {
                let Some(identity) = self.connections.get(&target).map(|c| c.identity) else {
                    return;
                };
                self.ban(identity);
                self.terminate(target, CloseReason::Banned, now);
            }
            Privileged::Pin(target) => {
                let threshold = self.config.vote_threshold;
                if let Some((index, item)) = self.list.get_mut(target) {
                    if !item.locked {
                        let before = item.state(threshold);
                        item.locked = true;
                        self.dispatcher.broadcast(&ServerMessage::Pinned(index));
                        self.log_transition(target, before);
                    }
                }
            }
            Privileged::Top(target) => {
                let Some(index) = self.list.position(target) else {
                    return;
                };
                let Some(before) = self.list.get(target).map(|item| item.state(self.config.vote_threshold)) else {
                    return;
                };
                let reachable = self.list.distance_to_barrier(index);
                if reachable < index {
                    debug!("Item {} stops {} rows short of the head", target, index - reachable);
                }
                for from in self.list.force_to_top(index) {
                    self.dispatcher.broadcast(&ServerMessage::Moved(from));
                }
                self.log_transition(target, before);
            }
        }
    }

    fn strike(&mut self, identity: Identity, heuristic: Heuristic) {
        let count = self.abuse.strike(identity, heuristic);
        warn!("{} strike {} for {}", heuristic, count, identity);
        if self.abuse.crosses_threshold(count) {
            self.ban(identity);
        }
    }

    /// Bans `identity` and drops its strike counters.
    fn ban(&mut self, identity: Identity) {
        let fresh = self.bans.ban(identity);
        self.abuse.forget(&identity);
        if fresh {
            warn!(
                "Banned {} ({} banned, {} strike counters open)",
                identity,
                self.bans.len(),
                self.abuse.len()
            );
        }
    }

    fn rollover(&mut self) {
        let count = self.list.len();
        match self.list.rollover(&self.config.file_format) {
            Ok(archive) => {
                info!("Rolled over {} items into {}", count, archive.display());
                for connection in self.connections.values_mut() {
                    connection.idle.cancel();
                }
                self.dispatcher.broadcast(&ServerMessage::Reset(true));
            }
            Err(e) => error!("Rollover failed: {}", e),
        }
    }

    pub fn on_pong(&mut self, id: SessionId) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.alive = true;
        }
    }

    pub fn on_close(&mut self, id: SessionId, now: Instant) {
        self.dispatcher.remove_client(id);
        self.teardown(id, CloseReason::ClientClosed, now);
    }

    /// Server-side forced close.
    pub fn terminate(&mut self, id: SessionId, reason: CloseReason, now: Instant) {
        self.dispatcher.close(id);
        self.teardown(id, reason, now);
    }

    fn teardown(&mut self, id: SessionId, reason: CloseReason, now: Instant) -> bool {
        let Some(connection) = self.connections.remove(&id) else {
            return false;
        };
        self.admission.remove(&connection.identity);
        debug!("{} addresses connected", self.admission.tracked());

        if let Some((index, _)) = self.list.remove(id) {
            self.dispatcher.broadcast(&ServerMessage::Removed(index));
        }

        let lifetime = now.saturating_duration_since(connection.connected_at);
        info!(
            "Disconnected session {} ({}) after {:?}: {}",
            id, connection.identity, lifetime, reason
        );
        if self.config.anti_abuse && lifetime < self.config.quick_disconnect {
            self.strike(connection.identity, Heuristic::QuickDisconnect);
        }

        self.dispatcher.broadcast(&ServerMessage::Left(self.connections.len()));
        self.broadcast_counts();
        true
    }

    fn on_idle_expired(&mut self, id: SessionId, generation: u64, now: Instant) {
        let current = self
            .connections
            .get(&id)
            .is_some_and(|c| c.idle.is_current(generation));
        if current {
            info!("Kicking idle session {}", id);
            self.terminate(id, CloseReason::Idle, now);
        }
    }

    /// Keepalive round: terminate connections that missed the previous ping, ping the rest.
    pub fn heartbeat(&mut self, now: Instant) {
        let ids: Vec<SessionId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(connection) = self.connections.get_mut(&id) else {
                continue;
            };
            if !connection.alive {
                info!("Pruning dead connection {}", id);
                self.terminate(id, CloseReason::Unresponsive, now);
                continue;
            }
            connection.alive = false;
            self.dispatcher.ping(id);
        }
        debug!("Pinged {} connections", self.dispatcher.len());
    }

    /// Debounced save of both documents.
    pub fn flush(&mut self) {
        if let Err(e) = self.list.maybe_save() {
            error!("Failed to save list: {}", e);
        }
        if let Err(e) = self.chat.maybe_save() {
            error!("Failed to save {}: {}", self.chat.key().display(), e);
        }
    }

    /// Unconditional save, used on shutdown.
    pub fn final_flush(&mut self) {
        if let Err(e) = self.list.force_save() {
            error!("Failed to save list on shutdown: {}", e);
        }
        if let Err(e) = self.chat.force_save() {
            error!("Failed to save chat on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::{Outbound, OutboundReceiver};
    use crate::core::persistence::{FailingStore, MemoryStore};
    use serde_json::Value;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    struct Harness {
        engine: Engine,
        store: MemoryStore,
        _events: mpsc::UnboundedReceiver<HubEvent>,
        t0: Instant,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let store = MemoryStore::new();
            let (tx, rx) = mpsc::unbounded_channel();
            let engine = Engine::new(config, Arc::new(store.clone()), tx);
            Self {
                engine,
                store,
                _events: rx,
                t0: Instant::now(),
            }
        }

        fn at(&self, secs: u64) -> Instant {
            self.t0 + Duration::from_secs(secs)
        }

        fn join(&mut self, identity: IpAddr) -> (SessionId, OutboundReceiver) {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = self.engine.admit(identity, None, tx, self.t0).unwrap();
            (id, rx)
        }

        fn send(&mut self, id: SessionId, text: &str, secs: u64) {
            let now = self.at(secs);
            self.engine.on_message(id, text, now);
        }
    }

    fn frames(rx: &mut OutboundReceiver) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Outbound::Frame(text) = message {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn quiet_config() -> Config {
        Config {
            quick_disconnect: Duration::ZERO,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn initial_then_joined() {
        let mut h = Harness::new(quiet_config());
        let (id, mut rx) = h.join(ip(1));
        let got = frames(&mut rx);
        assert_eq!(got[0]["initial"]["id"], id);
        assert_eq!(got[0]["initial"]["config"]["title"], "edit-fight");
        assert_eq!(got[1]["joined"], 1);
        assert_eq!(got[2]["counts"], serde_json::json!({"story": 0, "chat": 0, "idle": 1}));
    }

    #[tokio::test]
    async fn tab_switches_are_counted_for_everyone() {
        let mut h = Harness::new(quiet_config());
        let (a, mut ra) = h.join(ip(1));
        let (b, mut rb) = h.join(ip(2));
        frames(&mut ra);
        frames(&mut rb);

        h.send(a, r#"{"tab": "chat"}"#, 1);
        h.send(b, r#"{"tab": "story"}"#, 1);
        let got = frames(&mut rb);
        assert_eq!(got[0]["counts"], serde_json::json!({"story": 0, "chat": 1, "idle": 1}));
        assert_eq!(got[1]["counts"], serde_json::json!({"story": 1, "chat": 1, "idle": 0}));

        // same tab again, unknown tab: no broadcast
        h.send(a, r#"{"tab": "chat"}"#, 2);
        h.send(a, r#"{"tab": "lobby"}"#, 2);
        assert!(frames(&mut rb).is_empty());
        assert!(h.engine.is_connected(a));

        h.engine.on_close(a, h.at(3));
        let got = frames(&mut rb);
        assert_eq!(got[0]["left"], 1);
        assert_eq!(got[1]["counts"], serde_json::json!({"story": 1, "chat": 0, "idle": 0}));
    }

    #[tokio::test]
    async fn cap_rejects_fourth_connection() {
        let mut h = Harness::new(quiet_config());
        let _a = h.join(ip(5));
        let _b = h.join(ip(5));
        let _c = h.join(ip(5));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(h.engine.admit(ip(5), None, tx, h.t0), Err(Rejection::CapExceeded));
        assert_eq!(h.engine.open_from(&ip(5)), 3);
        assert_eq!(h.engine.connection_count(), 3);
    }

    #[tokio::test]
    async fn origin_is_checked_first() {
        let config = Config {
            origin: Some("https://rank.example".into()),
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            h.engine.admit(ip(1), Some("https://evil.example"), tx.clone(), h.t0),
            Err(Rejection::OriginMismatch)
        );
        assert_eq!(h.engine.admit(ip(1), None, tx.clone(), h.t0), Err(Rejection::OriginMismatch));
        assert!(h.engine.admit(ip(1), Some("https://rank.example"), tx, h.t0).is_ok());
    }

    #[tokio::test]
    async fn edit_creates_then_updates() {
        let mut h = Harness::new(quiet_config());
        let (id, mut rx) = h.join(ip(1));
        frames(&mut rx);

        h.send(id, r#"{"edit": "hello there"}"#, 1);
        h.send(id, r#"{"edit": "hellos"}"#, 2);
        let got = frames(&mut rx);
        assert_eq!(got[0]["added"]["text"], "hellothere");
        assert_eq!(got[1]["update"], serde_json::json!({"id": id, "text": "hellos"}));
        assert_eq!(h.engine.items().len(), 1);
        assert!(h.engine.is_idle_armed(id));
    }

    #[tokio::test]
    async fn oversized_edit_terminates_and_strikes() {
        let config = Config {
            abuse_ban_threshold: 1,
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let (id, mut rx) = h.join(ip(1));
        h.send(id, r#"{"edit": "a"}"#, 1);
        h.send(id, r#"{"edit": "abcdefghijklmnop"}"#, 2);

        assert!(!h.engine.is_connected(id));
        assert!(h.engine.items().is_empty());
        assert!(h.engine.is_banned(&ip(1)));
        let closed = std::iter::from_fn(|| rx.try_recv().ok()).any(|m| m == Outbound::Close);
        assert!(closed);
    }

    #[tokio::test]
    async fn self_vote_terminates_without_ban() {
        let mut h = Harness::new(quiet_config());
        let (id, _rx) = h.join(ip(1));
        h.send(id, r#"{"edit": "mine"}"#, 1);
        h.send(id, &format!(r#"{{"vote": {id}}}"#), 2);
        assert!(!h.engine.is_connected(id));
        assert!(!h.engine.is_banned(&ip(1)));
    }

    #[tokio::test]
    async fn same_address_vote_terminates_voter() {
        let config = Config {
            promotion_mode: PromotionMode::Immediate,
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let (other, _ro) = h.join(ip(2));
        let (a, mut ra) = h.join(ip(1));
        let (b, _rb) = h.join(ip(1));
        h.send(other, r#"{"edit": "zero"}"#, 1);
        h.send(a, r#"{"edit": "first"}"#, 1);
        h.send(b, r#"{"edit": "second"}"#, 1);
        frames(&mut ra);

        h.send(a, &format!(r#"{{"vote": {b}}}"#), 5);
        assert!(!h.engine.is_connected(a));
        let closed = std::iter::from_fn(|| ra.try_recv().ok()).any(|m| m == Outbound::Close);
        assert!(closed);
        // the voter's item goes, the target keeps its votes
        assert_eq!(h.engine.position(a), None);
        assert_eq!(h.engine.position(b), Some(1));
        assert_eq!(h.engine.items()[1].votes, 0);
        assert!(h.engine.is_connected(b));
        assert!(!h.engine.is_banned(&ip(1)));
        assert_eq!(h.engine.open_from(&ip(1)), 1);
    }

    #[tokio::test]
    async fn cooldown_gates_votes() {
        let config = Config {
            promotion_mode: PromotionMode::Immediate,
            vote_cooldown: Duration::from_secs(2),
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let (a, _ra) = h.join(ip(1));
        let (b, _rb) = h.join(ip(2));
        let (c, _rc) = h.join(ip(3));
        h.send(a, r#"{"edit": "a"}"#, 0);
        h.send(b, r#"{"edit": "b"}"#, 0);
        h.send(c, r#"{"edit": "c"}"#, 0);

        h.send(a, &format!(r#"{{"vote": {c}}}"#), 10);
        assert_eq!(h.engine.position(c), Some(1));
        // inside the cooldown
        h.send(a, &format!(r#"{{"vote": {c}}}"#), 11);
        assert_eq!(h.engine.position(c), Some(1));
        // 2s after the last accepted vote
        h.send(a, &format!(r#"{{"vote": {c}}}"#), 12);
        assert_eq!(h.engine.position(c), Some(0));
    }

    #[tokio::test]
    async fn threshold_votes_promote_from_five_to_two() {
        let config = Config {
            vote_threshold: 3,
            vote_cooldown: Duration::from_secs(2),
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for n in 0..6 {
            let (id, rx) = h.join(ip(n + 1));
            h.send(id, &format!(r#"{{"edit": "w{n}"}}"#), 0);
            ids.push(id);
            receivers.push(rx);
        }
        let target = ids[5];
        assert_eq!(h.engine.position(target), Some(5));
        let mut observer = receivers.remove(0);
        frames(&mut observer);

        let voters = [ids[0], ids[1], ids[2]];
        for round in 0..3u64 {
            for voter in voters {
                h.send(voter, &format!(r#"{{"vote": {target}}}"#), 10 + round * 3);
            }
        }

        assert_eq!(h.engine.position(target), Some(2));
        let moved: Vec<Value> = frames(&mut observer).into_iter().filter(|f| f.get("moved").is_some()).collect();
        assert_eq!(moved.len(), 3);
        assert_eq!(moved[0]["moved"], 5);
        assert_eq!(moved[2]["moved"], 3);
    }

    #[tokio::test]
    async fn pin_blocks_promotion_and_top_stops_under_it() {
        let config = Config {
            promotion_mode: PromotionMode::Immediate,
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let mut ids = Vec::new();
        for n in 0..5 {
            let (id, _) = h.join(ip(n + 1));
            h.send(id, &format!(r#"{{"edit": "w{n}"}}"#), 0);
            ids.push(id);
        }
        let admin = ids[0];
        h.send(admin, &format!(r#"{{"sudo": {{"name": "pin", "arg": {}}}}}"#, ids[1]), 1);
        h.send(admin, &format!(r#"{{"sudo": {{"name": "top", "arg": {}}}}}"#, ids[4]), 2);
        assert_eq!(h.engine.position(ids[4]), Some(2));
        assert_eq!(h.engine.position(ids[1]), Some(1));

        h.send(ids[3], &format!(r#"{{"vote": {}}}"#, ids[4]), 5);
        h.send(ids[2], &format!(r#"{{"vote": {}}}"#, ids[4]), 10);
        assert_eq!(h.engine.position(ids[4]), Some(2));
    }

    #[tokio::test]
    async fn ban_terminates_and_blocks_readmission() {
        let mut h = Harness::new(quiet_config());
        let (admin, _ra) = h.join(ip(1));
        let (victim, _rv) = h.join(ip(2));
        h.send(admin, &format!(r#"{{"sudo": {{"name": "ban", "arg": {victim}}}}}"#), 1);

        assert!(!h.engine.is_connected(victim));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(h.engine.admit(ip(2), None, tx, h.at(2)), Err(Rejection::Banned));
    }

    #[tokio::test]
    async fn ban_forgets_strikes_of_that_address() {
        let config = Config {
            quick_disconnect: Duration::from_millis(1500),
            abuse_ban_threshold: 3,
            ..Config::default()
        };
        let mut h = Harness::new(config);
        let (id, _rx) = h.join(ip(9));
        h.engine.on_close(id, h.t0 + Duration::from_millis(100));
        let (id, _rx) = h.join(ip(7));
        h.engine.on_close(id, h.t0 + Duration::from_millis(100));
        assert_eq!(h.engine.abuse.strikes(&ip(9), Heuristic::QuickDisconnect), 1);

        let (admin, _ra) = h.join(ip(1));
        let (victim, _rv) = h.join(ip(9));
        h.send(admin, &format!(r#"{{"sudo": {{"name": "ban", "arg": {victim}}}}}"#), 60);
        assert!(h.engine.is_banned(&ip(9)));
        assert_eq!(h.engine.abuse.strikes(&ip(9), Heuristic::QuickDisconnect), 0);
        assert_eq!(h.engine.abuse.strikes(&ip(7), Heuristic::QuickDisconnect), 1);

        // a ban reached through strikes clears the counters too
        for _ in 0..2 {
            let (id, _rx) = h.join(ip(7));
            h.engine.on_close(id, h.t0 + Duration::from_millis(200));
        }
        assert!(h.engine.is_banned(&ip(7)));
        assert!(h.engine.abuse.is_empty());
    }

    #[tokio::test]
    async fn sudo_can_be_disabled() {
        let config = Config {
            enable_sudo: false,
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let (admin, _ra) = h.join(ip(1));
        let (victim, _rv) = h.join(ip(2));
        h.send(admin, &format!(r#"{{"sudo": {{"name": "ban", "arg": {victim}}}}}"#), 1);
        assert!(h.engine.is_connected(victim));
    }

    #[tokio::test]
    async fn disconnect_removes_own_item_with_prior_index() {
        let mut h = Harness::new(quiet_config());
        let (a, _ra) = h.join(ip(1));
        let (b, _rb) = h.join(ip(2));
        let (c, mut rc) = h.join(ip(3));
        for (id, word) in [(a, "a"), (b, "b"), (c, "c")] {
            h.send(id, &format!(r#"{{"edit": "{word}"}}"#), 0);
        }
        frames(&mut rc);

        h.engine.on_close(b, h.at(5));
        let got = frames(&mut rc);
        assert_eq!(got[0]["removed"], 1);
        assert_eq!(got[1]["left"], 2);
        let ids: Vec<SessionId> = h.engine.items().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[tokio::test]
    async fn quick_disconnects_lead_to_ban() {
        let config = Config {
            quick_disconnect: Duration::from_millis(1500),
            abuse_ban_threshold: 2,
            ..Config::default()
        };
        let mut h = Harness::new(config);
        for _ in 0..2 {
            let (id, _rx) = h.join(ip(9));
            h.engine.on_close(id, h.t0 + Duration::from_millis(100));
        }
        assert!(h.engine.is_banned(&ip(9)));

        // a long-lived connection does not strike
        let (id, _rx) = h.join(ip(8));
        h.engine.on_close(id, h.at(60));
        assert!(!h.engine.is_banned(&ip(8)));
    }

    #[tokio::test]
    async fn heartbeat_prunes_silent_connections() {
        let mut h = Harness::new(quiet_config());
        let (a, mut ra) = h.join(ip(1));
        let (b, _rb) = h.join(ip(2));
        frames(&mut ra);

        h.engine.heartbeat(h.at(30));
        assert_eq!(ra.try_recv().unwrap(), Outbound::Ping);
        h.engine.on_pong(a);
        h.engine.heartbeat(h.at(60));

        assert!(h.engine.is_connected(a));
        assert!(!h.engine.is_connected(b));
        assert_eq!(h.engine.open_from(&ip(2)), 0);
    }

    #[tokio::test]
    async fn rollover_resets_list_and_signals_everyone() {
        let config = Config {
            max_items: 3,
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for n in 0..3 {
            let (id, rx) = h.join(ip(n + 1));
            ids.push(id);
            receivers.push(rx);
        }
        for rx in receivers.iter_mut() {
            frames(rx);
        }
        for (n, id) in ids.iter().enumerate() {
            h.send(*id, &format!(r#"{{"edit": "w{n}"}}"#), 1);
        }

        assert!(h.engine.items().is_empty());
        for rx in receivers.iter_mut() {
            let got = frames(rx);
            assert_eq!(got.last().unwrap(), &serde_json::json!({"reset": true}));
        }
        assert!(h.store.get(Path::new("data/story000.json")).is_some());
        assert_eq!(h.store.get(Path::new("data/story.json")).unwrap(), b"[]".to_vec());
        assert!(!h.engine.is_idle_armed(ids[0]));

        // participants can start over
        h.send(ids[0], r#"{"edit": "again"}"#, 2);
        assert_eq!(h.engine.items().len(), 1);
    }

    #[tokio::test]
    async fn rollover_completes_when_saving_the_empty_list_fails() {
        let config = Config {
            max_items: 2,
            ..quiet_config()
        };
        let store = FailingStore::new();
        let (tx, _events) = mpsc::unbounded_channel();
        let mut engine = Engine::new(config, Arc::new(store.clone()), tx);
        let now = Instant::now();
        let mut sessions = Vec::new();
        for n in 1..=2 {
            let (out, mut rx) = mpsc::unbounded_channel();
            let id = engine.admit(ip(n), None, out, now).unwrap();
            frames(&mut rx);
            sessions.push((id, rx));
        }

        store.fail_empty_writes(true);
        for (n, (id, _)) in sessions.iter().enumerate() {
            engine.on_message(*id, &format!(r#"{{"edit": "w{n}"}}"#), now);
        }

        assert!(engine.items().is_empty());
        for (id, rx) in sessions.iter_mut() {
            assert!(!engine.is_idle_armed(*id));
            let got = frames(rx);
            assert_eq!(got.last().unwrap(), &serde_json::json!({"reset": true}));
        }
        let archived: Vec<ListItem> =
            serde_json::from_slice(&store.inner.get(Path::new("data/story000.json")).unwrap()).unwrap();
        assert_eq!(archived.len(), 2);
        assert!(store.inner.get(Path::new("data/story.json")).is_none());

        // the emptied list is written by the next save
        store.fail_empty_writes(false);
        engine.flush();
        assert_eq!(store.inner.get(Path::new("data/story.json")).unwrap(), b"[]".to_vec());
    }

    #[tokio::test]
    async fn failed_flush_is_retried_on_the_next_tick() {
        let store = FailingStore::new();
        let (tx, _events) = mpsc::unbounded_channel();
        let mut engine = Engine::new(quiet_config(), Arc::new(store.clone()), tx);
        let (out, _rx) = mpsc::unbounded_channel();
        let id = engine.admit(ip(1), None, out, Instant::now()).unwrap();
        engine.on_message(id, r#"{"chat": "kept"}"#, Instant::now());

        store.fail_writes(true);
        engine.flush();
        assert!(engine.chat.is_dirty());
        assert!(store.inner.get(Path::new("data/chat.json")).is_none());

        store.fail_writes(false);
        engine.flush();
        assert!(!engine.chat.is_dirty());
        let saved: Vec<ChatLine> = serde_json::from_slice(&store.inner.get(Path::new("data/chat.json")).unwrap()).unwrap();
        assert_eq!(saved[0].text, "kept");
    }

    #[tokio::test]
    async fn chat_is_bounded_and_flushed() {
        let config = Config {
            max_chat_lines: 2,
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let (id, _rx) = h.join(ip(1));
        for text in ["one", "two", "three"] {
            h.send(id, &format!(r#"{{"chat": "{text}"}}"#), 1);
        }
        let texts: Vec<&str> = h.engine.chat_lines().iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);

        h.engine.flush();
        let saved: Vec<ChatLine> = serde_json::from_slice(&h.store.get(Path::new("data/chat.json")).unwrap()).unwrap();
        assert_eq!(saved.len(), 2);
    }

    #[tokio::test]
    async fn malformed_and_unknown_input_is_harmless() {
        let mut h = Harness::new(quiet_config());
        let (id, mut rx) = h.join(ip(1));
        frames(&mut rx);
        h.send(id, "{{{", 1);
        h.send(id, r#"{"nope": 1}"#, 1);
        h.send(id, r#"{"vote": 999}"#, 1);
        assert!(h.engine.is_connected(id));
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn reload_keeps_items_and_avoids_id_reuse() {
        let store = MemoryStore::new();
        let saved = vec![ListItem::new(41, "old")];
        store.insert("data/story.json", serde_json::to_vec(&saved).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(quiet_config(), Arc::new(store), tx);

        let (out, _orx) = mpsc::unbounded_channel();
        let id = engine.admit(ip(1), None, out, Instant::now()).unwrap();
        assert_eq!(id, 42);
        assert_eq!(engine.items()[0].text, "old");
    }

    #[test]
    fn idle_grace_scales_with_votes() {
        let base = Duration::from_secs(60);
        assert_eq!(idle_grace(base, 0), base);
        assert_eq!(idle_grace(base, 1), base);
        assert_eq!(idle_grace(base, 4), base * 4);
    }

    #[test]
    fn idle_grace_saturates() {
        assert_eq!(idle_grace(Duration::MAX, 2), Duration::MAX);
        assert_eq!(idle_grace(Duration::from_secs(u64::MAX / 2), u32::MAX), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_fires_into_event_channel() {
        let config = Config {
            idle_base: Duration::from_secs(60),
            ..quiet_config()
        };
        let store = MemoryStore::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut engine = Engine::new(config, Arc::new(store), tx);
        let (out, _orx) = mpsc::unbounded_channel();
        let id = engine.admit(ip(1), None, out, Instant::now()).unwrap();
        engine.on_message(id, r#"{"edit": "x"}"#, Instant::now());

        let Some(event) = events.recv().await else {
            panic!("idle timer never fired");
        };
        assert!(matches!(event, HubEvent::IdleExpired { id: fired, .. } if fired == id));
        engine.handle(event, Instant::now());
        assert!(!engine.is_connected(id));
    }
}
