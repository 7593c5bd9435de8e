use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::connection::Connection;
use crate::subscription::SubscriptionGraph;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Player,
    Streamer,
    Sfu,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Player => write!(f, "player"),
            Role::Streamer => write!(f, "streamer"),
            Role::Sfu => write!(f, "sfu"),
        }
    }
}

/// Process-wide index of live connections, partitioned by role.
///
/// Each internal ID lives in exactly one of the three maps at a time. Held
/// strongly here; everyone else resolves through the registry by ID rather
/// than keeping a direct reference, so there is never a player ↔ streamer
/// reference cycle to unwind on teardown.
pub struct Registry {
    players: DashMap<ConnectionId, Arc<Connection>>,
    streamers: DashMap<ConnectionId, Arc<Connection>>,
    sfus: DashMap<ConnectionId, Arc<Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            players: DashMap::new(),
            streamers: DashMap::new(),
            sfus: DashMap::new(),
        }
    }

    fn map_for(&self, role: Role) -> &DashMap<ConnectionId, Arc<Connection>> {
        match role {
            Role::Player => &self.players,
            Role::Streamer => &self.streamers,
            Role::Sfu => &self.sfus,
        }
    }

    pub fn add(&self, conn: Arc<Connection>) {
        self.map_for(conn.role).insert(conn.id, conn);
    }

    pub fn remove(&self, role: Role, id: ConnectionId) -> Option<Arc<Connection>> {
        self.map_for(role).remove(&id).map(|(_, v)| v)
    }

    pub fn get(&self, role: Role, id: ConnectionId) -> Option<Arc<Connection>> {
        self.map_for(role).get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn enumerate(&self, role: Role) -> Vec<Arc<Connection>> {
        self.map_for(role).iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn count(&self, role: Role) -> usize {
        self.map_for(role).len()
    }

    /// Returns any streamer that currently has spare subscriber capacity.
    ///
    /// Selection policy: first-fit over the streamer map's iteration order.
    /// `DashMap` shards by key hash, so this order is stable for a given
    /// live set but not meaningfully "fair" or priority-ordered — this is
    /// a deliberate, documented choice, not a guarantee of any particular
    /// load-balancing behavior.
    pub fn find_available_streamer(&self, subs: &SubscriptionGraph) -> Option<Arc<Connection>> {
        self.streamers
            .iter()
            .find(|entry| subs.has_capacity(entry.key()))
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
