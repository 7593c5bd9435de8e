use std::collections::HashSet;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::registry::{ConnectionId, Registry, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindResult {
    Bound,
    RejectedCapacity,
    RejectedStreamerInactive,
}

struct StreamerSubs {
    subscribers: HashSet<ConnectionId>,
    capacity: u32,
}

/// Tracks which players are bound to which streamer. Mutations for a given
/// streamer are serialized through that streamer's own mutex, so the
/// capacity check and the insertion that follows it are atomic with
/// respect to other binds on the same streamer; binds against different
/// streamers proceed fully in parallel.
pub struct SubscriptionGraph {
    streamers: DashMap<ConnectionId, Mutex<StreamerSubs>>,
}

impl SubscriptionGraph {
    pub fn new() -> Self {
        Self {
            streamers: DashMap::new(),
        }
    }

    /// Makes a streamer eligible to receive subscribers. Must be called
    /// before `bind`/`find_available_streamer` will consider it — an
    /// un-identified streamer connection is not yet a valid bind target.
    pub fn register_streamer(&self, streamer_id: ConnectionId, capacity: u32) {
        self.streamers.insert(
            streamer_id,
            Mutex::new(StreamerSubs {
                subscribers: HashSet::new(),
                capacity,
            }),
        );
    }

    #[cfg(test)]
    pub fn set_capacity(&self, streamer_id: ConnectionId, capacity: u32) {
        self.register_streamer(streamer_id, capacity);
    }

    pub fn has_capacity(&self, streamer_id: &ConnectionId) -> bool {
        self.streamers
            .get(streamer_id)
            .map(|entry| {
                let subs = entry.lock().unwrap();
                subs.subscribers.len() < subs.capacity as usize
            })
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, streamer_id: &ConnectionId) -> usize {
        self.streamers
            .get(streamer_id)
            .map(|entry| entry.lock().unwrap().subscribers.len())
            .unwrap_or(0)
    }

    pub fn subscribers(&self, streamer_id: &ConnectionId) -> Vec<ConnectionId> {
        self.streamers
            .get(streamer_id)
            .map(|entry| entry.lock().unwrap().subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Atomic compare-and-bind: capacity check and insertion happen under
    /// the same streamer-local lock, so two racing binds can never both
    /// succeed past the cap.
    pub fn bind(
        &self,
        player_id: ConnectionId,
        streamer_id: ConnectionId,
        registry: &Registry,
    ) -> BindResult {
        let entry = match self.streamers.get(&streamer_id) {
            Some(entry) => entry,
            None => return BindResult::RejectedStreamerInactive,
        };

        {
            let mut subs = entry.lock().unwrap();
            if subs.subscribers.len() >= subs.capacity as usize {
                return BindResult::RejectedCapacity;
            }
            subs.subscribers.insert(player_id);
        }

        if let Some(player) = registry.get(Role::Player, player_id) {
            player.set_subscribed_streamer(Some(streamer_id));
        }
        BindResult::Bound
    }

    /// Idempotent: unbinding a player that isn't subscribed is a no-op.
    pub fn unbind(&self, player_id: ConnectionId, streamer_id: ConnectionId, registry: &Registry) {
        if let Some(entry) = self.streamers.get(&streamer_id) {
            entry.lock().unwrap().subscribers.remove(&player_id);
        }
        if let Some(player) = registry.get(Role::Player, player_id) {
            player.set_subscribed_streamer(None);
        }
    }

    /// Removes every edge incident to a disconnecting streamer, clearing
    /// each former subscriber's `subscribed_streamer` pointer. Returns the
    /// set of players that were unbound so the caller can notify them.
    pub fn sweep_streamer(&self, streamer_id: ConnectionId, registry: &Registry) -> Vec<ConnectionId> {
        let removed: Vec<ConnectionId> = match self.streamers.remove(&streamer_id) {
            Some((_, mutex)) => mutex.into_inner().unwrap().subscribers.into_iter().collect(),
            None => Vec::new(),
        };
        for player_id in &removed {
            if let Some(player) = registry.get(Role::Player, *player_id) {
                player.set_subscribed_streamer(None);
            }
        }
        removed
    }
}

impl Default for SubscriptionGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_conn(role: Role) -> Arc<Connection> {
        Arc::new(Connection::new(
            ConnectionId::new_v4(),
            role,
            ConnectionConfig {
                outbound_capacity: 8,
                ping_interval: Duration::from_secs(30),
                connection_timeout: Duration::from_secs(60),
            },
            Arc::new(crate::metrics::AtomicMetrics::new()),
        ))
    }

    #[test]
    fn bind_against_unregistered_streamer_is_rejected() {
        let subs = SubscriptionGraph::new();
        let registry = Registry::new();
        let result = subs.bind(ConnectionId::new_v4(), ConnectionId::new_v4(), &registry);
        assert_eq!(result, BindResult::RejectedStreamerInactive);
    }

    #[test]
    fn bind_sets_bidirectional_consistency() {
        let subs = SubscriptionGraph::new();
        let registry = Registry::new();
        let player = test_conn(Role::Player);
        let streamer = test_conn(Role::Streamer);
        registry.add(Arc::clone(&player));
        registry.add(Arc::clone(&streamer));
        subs.register_streamer(streamer.id, 10);

        let result = subs.bind(player.id, streamer.id, &registry);
        assert_eq!(result, BindResult::Bound);
        assert_eq!(player.subscribed_streamer(), Some(streamer.id));
        assert!(subs.subscribers(&streamer.id).contains(&player.id));
    }

    #[test]
    fn bind_enforces_capacity_cap() {
        let subs = SubscriptionGraph::new();
        let registry = Registry::new();
        let streamer = test_conn(Role::Streamer);
        registry.add(Arc::clone(&streamer));
        subs.register_streamer(streamer.id, 1);

        let p1 = test_conn(Role::Player);
        registry.add(Arc::clone(&p1));
        assert_eq!(subs.bind(p1.id, streamer.id, &registry), BindResult::Bound);

        let p2 = test_conn(Role::Player);
        registry.add(Arc::clone(&p2));
        assert_eq!(
            subs.bind(p2.id, streamer.id, &registry),
            BindResult::RejectedCapacity
        );
        assert_eq!(subs.subscriber_count(&streamer.id), 1);
    }

    #[test]
    fn unbind_is_idempotent() {
        let subs = SubscriptionGraph::new();
        let registry = Registry::new();
        let streamer = test_conn(Role::Streamer);
        registry.add(Arc::clone(&streamer));
        subs.register_streamer(streamer.id, 5);
        let player = test_conn(Role::Player);
        registry.add(Arc::clone(&player));
        subs.bind(player.id, streamer.id, &registry);

        subs.unbind(player.id, streamer.id, &registry);
        assert_eq!(player.subscribed_streamer(), None);
        subs.unbind(player.id, streamer.id, &registry);
        assert_eq!(player.subscribed_streamer(), None);
    }

    #[test]
    fn sweep_streamer_clears_all_subscribers() {
        let subs = SubscriptionGraph::new();
        let registry = Registry::new();
        let streamer = test_conn(Role::Streamer);
        registry.add(Arc::clone(&streamer));
        subs.register_streamer(streamer.id, 5);

        let p1 = test_conn(Role::Player);
        let p2 = test_conn(Role::Player);
        registry.add(Arc::clone(&p1));
        registry.add(Arc::clone(&p2));
        subs.bind(p1.id, streamer.id, &registry);
        subs.bind(p2.id, streamer.id, &registry);

        let removed = subs.sweep_streamer(streamer.id, &registry);
        assert_eq!(removed.len(), 2);
        assert_eq!(p1.subscribed_streamer(), None);
        assert_eq!(p2.subscribed_streamer(), None);
        assert_eq!(subs.subscriber_count(&streamer.id), 0);
        assert!(!subs.has_capacity(&streamer.id)); // unregistered — no longer a valid target
    }
}
