//! # Admission Table
//!
//! Counts concurrently open connections per identity (remote IP address) and
//! enforces the per-identity cap. Entries disappear when their count drops to
//! zero, so the table only ever holds identities with live connections.

use std::collections::HashMap;
use std::net::IpAddr;

/// Identity used for admission and ban decisions.
pub type Identity = IpAddr;

#[derive(Debug)]
pub struct AdmissionTable {
    max_per_identity: u32,
    counts: HashMap<Identity, u32>,
}

impl AdmissionTable {
    pub fn new(max_per_identity: u32) -> Self {
        Self {
            max_per_identity,
            counts: HashMap::new(),
        }
    }

    pub fn count(&self, identity: &Identity) -> u32 {
        self.counts.get(identity).copied().unwrap_or(0)
    }

    pub fn can_add(&self, identity: &Identity) -> bool {
        self.count(identity) < self.max_per_identity
    }

    pub fn add(&mut self, identity: Identity) {
        *self.counts.entry(identity).or_insert(0) += 1;
    }

    pub fn remove(&mut self, identity: &Identity) {
        if let Some(count) = self.counts.get_mut(identity) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(identity);
            }
        }
    }

    /// Number of identities with at least one open connection.
    pub fn tracked(&self) -> usize {
        self.counts.len()
    }
}
