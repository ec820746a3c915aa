//! Client table and subscription model.
//!
//! Grounded on `t_PvdClient`/`AddSubscription`/`RemoveSubscription`/
//! `ReleaseClient` in `examples/original_source/src/pvdd.c`. The source's
//! fixed-size client array with a sentinel "dead" fd becomes a
//! `Vec<Option<Client>>`, tombstoned on release and compacted once per loop
//! iteration (spec.md 9).

use std::collections::HashSet;

use tokio::net::TcpStream;

use crate::wire::{ConnectionMode, FrameReader};

pub const MAX_CLIENTS: usize = 1024;

/// Subscription mask bits (spec.md 4.3). `SUBSCRIBE_NOTIFICATIONS` with no
/// argument sets all three.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionMask {
    pub list: bool,
    pub new_pvd: bool,
    pub del_pvd: bool,
}

impl SubscriptionMask {
    pub fn all() -> Self {
        SubscriptionMask {
            list: true,
            new_pvd: true,
            del_pvd: true,
        }
    }

    pub fn any(&self) -> bool {
        self.list || self.new_pvd || self.del_pvd
    }
}

/// State for a single accepted connection.
pub struct Client {
    pub id: u64,
    pub stream: TcpStream,
    pub mode: ConnectionMode,
    pub reader: FrameReader,
    /// Per-PvD-name interest tokens; `*` is stored as `wildcard`.
    pub subscriptions: HashSet<String>,
    pub wildcard: bool,
    pub notification_mask: SubscriptionMask,
    /// Name of the PvD this client has an open `BEGIN_TRANSACTION` on, if
    /// any. spec.md 3: at most one in-flight transaction per client.
    pub open_transaction: Option<String>,
    pub alive: bool,
}

impl Client {
    pub fn new(id: u64, stream: TcpStream) -> Self {
        Client {
            id,
            stream,
            mode: ConnectionMode::General,
            reader: FrameReader::new(),
            subscriptions: HashSet::new(),
            wildcard: false,
            notification_mask: SubscriptionMask::default(),
            open_transaction: None,
            alive: true,
        }
    }

    /// Adds a per-PvD subscription token. `*` sets the wildcard; duplicate
    /// adds are no-ops, per spec.md 4.3.
    pub fn subscribe(&mut self, token: &str) {
        if token == "*" {
            self.wildcard = true;
        } else {
            self.subscriptions.insert(token.to_string());
        }
    }

    pub fn unsubscribe(&mut self, token: &str) {
        if token == "*" {
            self.wildcard = false;
        } else {
            self.subscriptions.remove(token);
        }
    }

    pub fn interested_in(&self, pvd_name: &str) -> bool {
        self.wildcard || self.subscriptions.contains(pvd_name)
    }

    /// Whether this client is eligible for attribute-change fan-out at all
    /// (spec.md 4.3: CONTROL connections never receive it).
    pub fn receives_attribute_notifications(&self) -> bool {
        self.mode != ConnectionMode::Control
    }
}

/// The live client table: tombstone-and-compact, never reindexed mid-loop.
#[derive(Default)]
pub struct ClientTable {
    clients: Vec<Option<Client>>,
    next_id: u64,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= MAX_CLIENTS
    }

    /// Inserts a newly accepted connection. Caller must have already
    /// checked `is_full()`.
    pub fn insert(&mut self, stream: TcpStream) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let client = Client::new(id, stream);
        if let Some(slot) = self.clients.iter_mut().find(|c| c.is_none()) {
            *slot = Some(client);
        } else {
            self.clients.push(Some(client));
        }
        id
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Client> {
        self.clients
            .iter_mut()
            .flatten()
            .find(|c| c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.clients.iter_mut().flatten()
    }

    /// Marks a client dead; it is removed at the next `compact()`.
    pub fn release(&mut self, id: u64) {
        if let Some(client) = self.get_mut(id) {
            client.alive = false;
        }
    }

    /// Removes all dead entries. Called once per event-loop iteration, per
    /// spec.md 4.6.
    pub fn compact(&mut self) {
        for slot in self.clients.iter_mut() {
            if matches!(slot, Some(c) if !c.alive) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_table() -> ClientTable {
        ClientTable::new()
    }

    #[test]
    fn wildcard_subscription_matches_any_name() {
        let mut mask = SubscriptionMask::default();
        mask.list = true;
        assert!(mask.any());
    }

    #[test]
    fn empty_table_has_zero_len() {
        let table = dummy_table();
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());
    }
}
