use std::sync::Arc;

use broker_protocol::{canonical, Envelope};

use crate::connection::Connection;
use crate::error::BrokerError;
use crate::registry::Role;
use crate::state::BrokerState;
use crate::subscription::BindResult;

use super::streamer;

const FORWARDED_TYPES: &[&str] = &[
    "offer",
    "answer",
    "iceCandidate",
    "iceCandidateError",
    "dataChannelRequest",
];

pub async fn handle(state: &Arc<BrokerState>, conn: &Arc<Connection>, env: Envelope) {
    match env.msg_type.as_str() {
        "identify" => identify(state, conn, &env),
        t if FORWARDED_TYPES.contains(&t) => forward_to_streamer(state, conn, env),
        other => tracing::debug!(player = %conn.id, msg_type = other, "unhandled player message"),
    }
}

fn identify(state: &Arc<BrokerState>, conn: &Arc<Connection>, env: &Envelope) {
    if let Some(player_id) = env.field_str("playerId") {
        conn.set_logical_id(player_id.to_string());
    }
    conn.send(&canonical::config());

    let Some(target) = state.registry.find_available_streamer(&state.subscriptions) else {
        return;
    };

    match state.subscriptions.bind(conn.id, target.id, &state.registry) {
        BindResult::Bound => {
            let sfu = target.role == Role::Sfu;
            target.send(&canonical::player_connected(conn.id.to_string(), true, sfu, true));
            streamer::notify_player_count(state, target.id);
        }
        BindResult::RejectedCapacity => {
            conn.send(&canonical::error(BrokerError::CapacityExceeded.to_string()));
            state.metrics.capacity_rejected();
        }
        BindResult::RejectedStreamerInactive => {
            // find_available_streamer only returns registered streamers, so
            // this can only happen if the streamer disconnected between the
            // lookup and the bind — treat it the same as "none available".
        }
    }
}

fn forward_to_streamer(state: &Arc<BrokerState>, conn: &Arc<Connection>, mut env: Envelope) {
    let Some(streamer_id) = conn.subscribed_streamer() else {
        conn.send(&canonical::error(BrokerError::NoActiveStreamer.to_string()));
        return;
    };

    let target = state
        .registry
        .get(Role::Streamer, streamer_id)
        .or_else(|| state.registry.get(Role::Sfu, streamer_id));

    let Some(target) = target else {
        conn.send(&canonical::error(BrokerError::NoActiveStreamer.to_string()));
        return;
    };

    env.stamp_id_if_absent(conn.id.to_string());
    target.send(&env);
    state.metrics.message_forwarded();
}
