use std::sync::Arc;

use broker_protocol::{canonical, Envelope};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::BrokerError;
use crate::registry::Role;
use crate::state::BrokerState;

use super::auto_streamer_id;

pub async fn handle(state: &Arc<BrokerState>, conn: &Arc<Connection>, env: Envelope) {
    match env.msg_type.as_str() {
        "identify" => identify(state, conn, &env),
        "offer" | "answer" | "iceCandidate" | "iceCandidateError" => {
            forward_to_player(state, conn, env);
        }
        "streamerDataChannels" => broadcast_to_subscribers(state, conn, &env),
        other => tracing::debug!(streamer = %conn.id, msg_type = other, "unhandled streamer message"),
    }
}

fn identify(state: &Arc<BrokerState>, conn: &Arc<Connection>, env: &Envelope) {
    let requested = env.field_str("streamerId").map(str::to_string);
    let new_id = requested.unwrap_or_else(|| auto_streamer_id(conn.id));
    let previous = conn.logical_id();
    conn.set_logical_id(new_id.clone());

    state
        .subscriptions
        .register_streamer(conn.id, state.config.limits.max_subscribers);
    conn.send(&canonical::config());

    if let Some(previous) = previous {
        if previous != new_id {
            for player_id in state.subscriptions.subscribers(&conn.id) {
                if let Some(player) = state.registry.get(Role::Player, player_id) {
                    player.send(&canonical::streamer_id_changed(new_id.clone()));
                }
            }
        }
    }
}

/// Shared with `sfu` — streamers and SFUs both forward per-player replies
/// using the same "target a subscriber by `id`" rule.
pub(crate) fn forward_to_player(state: &Arc<BrokerState>, conn: &Arc<Connection>, mut env: Envelope) {
    let Some(target_raw) = env.id.clone() else {
        tracing::debug!(streamer = %conn.id, "dropping forward with no target id");
        return;
    };
    let Ok(target_id) = Uuid::parse_str(&target_raw) else {
        tracing::debug!(streamer = %conn.id, target = %target_raw, "dropping forward with unparseable target id");
        return;
    };

    let Some(player) = state.registry.get(Role::Player, target_id) else {
        tracing::debug!(streamer = %conn.id, target = %target_raw, err = %BrokerError::TargetUnknown, "dropping forward");
        return;
    };

    if player.subscribed_streamer() != Some(conn.id) {
        tracing::debug!(streamer = %conn.id, target = %target_raw, err = %BrokerError::TargetUnknown, "dropping forward");
        return;
    }

    env.id = Some(target_raw);
    player.send(&env);
    state.metrics.message_forwarded();
}

/// Broadcasts verbatim to every current subscriber, pruning any that have
/// already closed (they'll be removed from the graph by the reaper/teardown
/// path shortly; this just avoids wasting a send on them).
pub(crate) fn broadcast_to_subscribers(state: &Arc<BrokerState>, conn: &Arc<Connection>, env: &Envelope) {
    for player_id in state.subscriptions.subscribers(&conn.id) {
        if let Some(player) = state.registry.get(Role::Player, player_id) {
            if player.is_closed() {
                continue;
            }
            player.send(env);
            state.metrics.message_forwarded();
        }
    }
}

/// Called whenever a streamer's subscriber set changes size.
pub(crate) fn notify_player_count(state: &Arc<BrokerState>, streamer_id: crate::registry::ConnectionId) {
    let target = state
        .registry
        .get(Role::Streamer, streamer_id)
        .or_else(|| state.registry.get(Role::Sfu, streamer_id));
    let Some(target) = target else { return };
    let count = state.subscriptions.subscriber_count(&streamer_id) as u32;
    target.send(&canonical::player_count(count));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::subscription::BindResult;
    use std::time::Duration;

    fn conn(role: Role) -> Arc<Connection> {
        Arc::new(Connection::new(
            Uuid::new_v4(),
            role,
            ConnectionConfig {
                outbound_capacity: 8,
                ping_interval: Duration::from_secs(30),
                connection_timeout: Duration::from_secs(60),
            },
            Arc::new(crate::metrics::AtomicMetrics::new()),
        ))
    }

    fn state() -> Arc<BrokerState> {
        BrokerState::new(
            broker_protocol::BrokerConfig::default(),
            Arc::new(crate::metrics::AtomicMetrics::new()),
        )
    }

    #[test]
    fn identify_without_requested_id_auto_generates() {
        let state = state();
        let streamer = conn(Role::Streamer);
        state.registry.add(Arc::clone(&streamer));
        identify(&state, &streamer, &Envelope::new("identify"));
        assert_eq!(streamer.logical_id(), Some(auto_streamer_id(streamer.id)));
    }

    #[test]
    fn identify_change_notifies_subscribers() {
        let state = state();
        let streamer = conn(Role::Streamer);
        state.registry.add(Arc::clone(&streamer));
        identify(&state, &streamer, &Envelope::new("identify").with_field("streamerId", "first"));

        let player = conn(Role::Player);
        state.registry.add(Arc::clone(&player));
        let bound = state.subscriptions.bind(player.id, streamer.id, &state.registry);
        assert_eq!(bound, BindResult::Bound);

        identify(&state, &streamer, &Envelope::new("identify").with_field("streamerId", "second"));
        let msg = player.next_outbound_now();
        assert!(msg.contains("streamerIdChanged"));
        assert!(msg.contains("second"));
    }

    #[test]
    fn forward_to_player_requires_subscriber_membership() {
        let state = state();
        let streamer = conn(Role::Streamer);
        state.registry.add(Arc::clone(&streamer));
        let player = conn(Role::Player);
        state.registry.add(Arc::clone(&player));
        // player never bound to this streamer
        let env = Envelope::new("answer")
            .with_field("sdp", "v=0")
            .with_id(player.id.to_string());
        forward_to_player(&state, &streamer, env);
        assert!(!player.has_outbound());
    }

    #[test]
    fn forward_to_player_delivers_to_subscriber() {
        let state = state();
        let streamer = conn(Role::Streamer);
        state.registry.add(Arc::clone(&streamer));
        state.subscriptions.register_streamer(streamer.id, 5);
        let player = conn(Role::Player);
        state.registry.add(Arc::clone(&player));
        state.subscriptions.bind(player.id, streamer.id, &state.registry);

        let env = Envelope::new("answer")
            .with_field("sdp", "v=0")
            .with_id(player.id.to_string());
        forward_to_player(&state, &streamer, env);
        let msg = player.next_outbound_now();
        assert!(msg.contains("\"sdp\":\"v=0\""));
    }
}
