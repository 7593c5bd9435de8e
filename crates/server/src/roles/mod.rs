pub mod player;
pub mod sfu;
pub mod streamer;

use std::sync::Arc;

use broker_protocol::{canonical, Envelope};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::BrokerError;
use crate::registry::Role;
use crate::state::BrokerState;

/// Shared `receive → classify → dispatch` skeleton: every message first
/// passes through here, then falls through to its role-specific handler
/// below if it wasn't one of the few types every role answers the same way.
pub async fn dispatch(state: &Arc<BrokerState>, conn: &Arc<Connection>, env: Envelope) {
    conn.touch();

    if try_handle_shared(conn, &env) {
        return;
    }

    match conn.role {
        Role::Player => player::handle(state, conn, env).await,
        Role::Streamer => streamer::handle(state, conn, env).await,
        Role::Sfu => sfu::handle(state, conn, env).await,
    }
}

/// Message types every role answers identically: app-level keepalive and
/// graceful disconnect. Returns `true` if the message was fully handled.
fn try_handle_shared(conn: &Arc<Connection>, env: &Envelope) -> bool {
    match env.msg_type.as_str() {
        "ping" => {
            conn.send(&canonical::pong());
            true
        }
        "disconnect" => {
            conn.close();
            true
        }
        _ => false,
    }
}

/// The reference server derives a stable id from the first 8 hex characters
/// of the connection's internal UUID when a streamer doesn't supply one.
pub fn auto_streamer_id(internal_id: Uuid) -> String {
    format!("streamer_{}", &internal_id.simple().to_string()[..8])
}

/// Called by the transport layer on teardown, regardless of role. Removes
/// the connection from the registry and, for streamers, sweeps every
/// subscription edge and notifies the displaced players.
pub fn teardown(state: &Arc<BrokerState>, conn: &Arc<Connection>) {
    state.registry.remove(conn.role, conn.id);
    state.metrics.connection_closed(conn.role);

    match conn.role {
        Role::Player => {
            if let Some(streamer_id) = conn.subscribed_streamer() {
                state.subscriptions.unbind(conn.id, streamer_id, &state.registry);
                streamer::notify_player_count(state, streamer_id);
            }
        }
        Role::Streamer | Role::Sfu => {
            let removed = state.subscriptions.sweep_streamer(conn.id, &state.registry);
            for player_id in removed {
                if let Some(player) = state.registry.get(Role::Player, player_id) {
                    player.send(&canonical::error(BrokerError::NoActiveStreamer.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_streamer_id_uses_first_eight_hex_chars() {
        let id = Uuid::from_u128(0x0123_4567_89ab_cdef_0000_0000_0000_0000);
        let label = auto_streamer_id(id);
        assert_eq!(label, "streamer_01234567");
    }
}
