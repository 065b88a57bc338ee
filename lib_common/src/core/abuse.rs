//! # Ban Set and Abuse Ledger
//!
//! Both tables live for the lifetime of the process and start empty; nothing
//! is persisted. Every heuristic strikes against its own per-identity counter
//! and all of them share one ban threshold.

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::admission::Identity;

/// Identities refused admission for the rest of the run. Append-only.
#[derive(Debug, Default)]
pub struct BanSet {
    banned: HashSet<Identity>,
}

impl BanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the identity was not banned before.
    pub fn ban(&mut self, identity: Identity) -> bool {
        self.banned.insert(identity)
    }

    pub fn is_banned(&self, identity: &Identity) -> bool {
        self.banned.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.banned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }
}

/// Which heuristic produced a strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heuristic {
    /// An edit changed the text length by more than allowed.
    OversizedEdit,
    /// A connection closed shortly after it was accepted.
    QuickDisconnect,
}

impl fmt::Display for Heuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Heuristic::OversizedEdit => write!(f, "oversized edit"),
            Heuristic::QuickDisconnect => write!(f, "quick disconnect"),
        }
    }
}

#[derive(Debug)]
pub struct AbuseLedger {
    threshold: u32,
    strikes: HashMap<(Identity, Heuristic), u32>,
}

impl AbuseLedger {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            strikes: HashMap::new(),
        }
    }

    /// Records one strike and returns the new count.
    pub fn strike(&mut self, identity: Identity, heuristic: Heuristic) -> u32 {
        let count = self.strikes.entry((identity, heuristic)).or_insert(0);
        *count += 1;
        *count
    }

    /// Whether `count` strikes are enough for a ban.
    pub fn crosses_threshold(&self, count: u32) -> bool {
        count >= self.threshold
    }

    pub fn strikes(&self, identity: &Identity, heuristic: Heuristic) -> u32 {
        self.strikes.get(&(*identity, heuristic)).copied().unwrap_or(0)
    }

    /// Drops every counter held for `identity`.
    pub fn forget(&mut self, identity: &Identity) {
        self.strikes.retain(|(who, _), _| who != identity);
    }

    /// Number of live counters across all addresses.
    pub fn len(&self) -> usize {
        self.strikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strikes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

    #[test]
    fn heuristics_count_separately() {
        let mut ledger = AbuseLedger::new(2);
        assert_eq!(ledger.strike(A, Heuristic::OversizedEdit), 1);
        assert_eq!(ledger.strike(A, Heuristic::QuickDisconnect), 1);
        let n = ledger.strike(A, Heuristic::OversizedEdit);
        assert_eq!(n, 2);
        assert!(ledger.crosses_threshold(n));
        assert_eq!(ledger.strikes(&A, Heuristic::QuickDisconnect), 1);
    }

    #[test]
    fn bans_are_sticky() {
        let mut bans = BanSet::new();
        assert!(bans.ban(A));
        assert!(!bans.ban(A));
        assert!(bans.is_banned(&A));
        assert_eq!(bans.len(), 1);
    }

    #[test]
    fn forget_drops_every_heuristic_for_one_address() {
        let b: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));
        let mut ledger = AbuseLedger::new(3);
        ledger.strike(A, Heuristic::OversizedEdit);
        ledger.strike(A, Heuristic::QuickDisconnect);
        ledger.strike(b, Heuristic::QuickDisconnect);
        assert_eq!(ledger.len(), 3);

        ledger.forget(&A);
        assert_eq!(ledger.strikes(&A, Heuristic::OversizedEdit), 0);
        assert_eq!(ledger.strikes(&A, Heuristic::QuickDisconnect), 0);
        assert_eq!(ledger.strikes(&b, Heuristic::QuickDisconnect), 1);
        assert_eq!(ledger.len(), 1);
    }
}
