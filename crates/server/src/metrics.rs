use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Tiny observer interface for the broker's internal counters. Kept as a
/// trait (rather than a concrete struct wired everywhere) so tests can swap
/// in a no-op or a recording implementation without touching call sites.
pub trait Metrics: Send + Sync {
    fn connection_opened(&self, role: crate::registry::Role);
    fn connection_closed(&self, role: crate::registry::Role);
    fn message_forwarded(&self);
    fn queue_full_dropped(&self);
    fn capacity_rejected(&self);
    fn malformed_frame(&self);

    /// Prometheus text exposition of whatever this implementation tracks.
    /// The no-op default lets test doubles skip implementing it.
    fn render_prometheus(&self, _started_at: Instant) -> String {
        String::new()
    }
}

/// Lock-free counter set, rendered as Prometheus text exposition format.
#[derive(Default)]
pub struct AtomicMetrics {
    players_connected: AtomicU64,
    streamers_connected: AtomicU64,
    sfus_connected: AtomicU64,
    messages_forwarded: AtomicU64,
    queue_full_drops: AtomicU64,
    capacity_rejections: AtomicU64,
    malformed_frames: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metrics for AtomicMetrics {
    fn connection_opened(&self, role: crate::registry::Role) {
        let counter = match role {
            crate::registry::Role::Player => &self.players_connected,
            crate::registry::Role::Streamer => &self.streamers_connected,
            crate::registry::Role::Sfu => &self.sfus_connected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, role: crate::registry::Role) {
        let counter = match role {
            crate::registry::Role::Player => &self.players_connected,
            crate::registry::Role::Streamer => &self.streamers_connected,
            crate::registry::Role::Sfu => &self.sfus_connected,
        };
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    fn message_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_full_dropped(&self) {
        self.queue_full_drops.fetch_add(1, Ordering::Relaxed);
    }

    fn capacity_rejected(&self) {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    fn render_prometheus(&self, uptime: Instant) -> String {
        let players = self.players_connected.load(Ordering::Relaxed);
        let streamers = self.streamers_connected.load(Ordering::Relaxed);
        let sfus = self.sfus_connected.load(Ordering::Relaxed);
        let forwarded = self.messages_forwarded.load(Ordering::Relaxed);
        let queue_full = self.queue_full_drops.load(Ordering::Relaxed);
        let capacity = self.capacity_rejections.load(Ordering::Relaxed);
        let malformed = self.malformed_frames.load(Ordering::Relaxed);
        let uptime_secs = uptime.elapsed().as_secs();

        format!(
            "# HELP broker_uptime_seconds Process uptime in seconds\n\
             # TYPE broker_uptime_seconds gauge\n\
             broker_uptime_seconds {uptime_secs}\n\
             \n\
             # HELP broker_connections_opened_total Connections opened, by role\n\
             # TYPE broker_connections_opened_total counter\n\
             broker_connections_opened_total{{role=\"player\"}} {players}\n\
             broker_connections_opened_total{{role=\"streamer\"}} {streamers}\n\
             broker_connections_opened_total{{role=\"sfu\"}} {sfus}\n\
             \n\
             # HELP broker_messages_forwarded_total Signalling messages forwarded\n\
             # TYPE broker_messages_forwarded_total counter\n\
             broker_messages_forwarded_total {forwarded}\n\
             \n\
             # HELP broker_queue_full_drops_total Messages dropped due to a full outbound queue\n\
             # TYPE broker_queue_full_drops_total counter\n\
             broker_queue_full_drops_total {queue_full}\n\
             \n\
             # HELP broker_capacity_rejections_total Subscription binds rejected for capacity\n\
             # TYPE broker_capacity_rejections_total counter\n\
             broker_capacity_rejections_total {capacity}\n\
             \n\
             # HELP broker_malformed_frames_total Frames rejected by the codec\n\
             # TYPE broker_malformed_frames_total counter\n\
             broker_malformed_frames_total {malformed}\n"
        )
    }
}
