use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::Message;
use broker_protocol::Envelope;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::metrics::Metrics;
use crate::registry::{ConnectionId, Role};

/// How long `close()` waits for the writer to drain the outbound queue
/// before hard-closing the socket.
pub const CLOSE_DRAIN_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub outbound_capacity: usize,
    pub ping_interval: Duration,
    pub connection_timeout: Duration,
}

struct QueuedMessage {
    wire: Message,
    critical: bool,
}

/// Result of offering a message to the bounded queue.
enum EnqueueOutcome {
    /// Room was available; nothing else in the queue was touched.
    Enqueued,
    /// Queue was full; an older non-critical message was evicted to make room.
    DroppedOldest,
    /// Queue was full of critical messages; the new message was dropped instead.
    Rejected,
}

/// Bounded outbound queue with a drop-oldest-non-critical backpressure
/// policy. `error` and `disconnect` messages are marked critical and are
/// never dropped; if the queue is full of critical messages, the new
/// message is dropped instead (the queue's size bound is never violated).
struct OutboundQueue {
    messages: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, msg: QueuedMessage) -> EnqueueOutcome {
        if self.messages.len() < self.capacity {
            self.messages.push_back(msg);
            return EnqueueOutcome::Enqueued;
        }

        if let Some(pos) = self.messages.iter().position(|m| !m.critical) {
            self.messages.remove(pos);
            self.messages.push_back(msg);
            return EnqueueOutcome::DroppedOldest;
        }

        EnqueueOutcome::Rejected
    }

    fn pop(&mut self) -> Option<QueuedMessage> {
        self.messages.pop_front()
    }
}

/// One per WebSocket socket. Owns the write path's backpressure policy,
/// liveness bookkeeping, and the role-specific logical state that the
/// role state machines mutate as they process messages.
///
/// Role handlers store only IDs here (never `Arc<Connection>` to a peer) —
/// every cross-connection lookup goes back through the `Registry`, so
/// there's no reference cycle to unwind on teardown.
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub connected_at: Instant,
    pub config: ConnectionConfig,

    /// Peer-supplied identifier: `playerId` for players, `streamerId`/
    /// auto-generated id for streamers, `sfuId` for SFUs.
    pub logical_id: Mutex<Option<String>>,
    /// Set only on player connections: the streamer currently subscribed to.
    pub subscribed_streamer: Mutex<Option<ConnectionId>>,

    last_activity: Mutex<Instant>,
    outbound: Mutex<OutboundQueue>,
    outbound_notify: Notify,
    close_notify: Notify,
    closed: AtomicBool,
    metrics: Arc<dyn Metrics>,
}

impl Connection {
    pub fn new(id: ConnectionId, role: Role, config: ConnectionConfig, metrics: Arc<dyn Metrics>) -> Self {
        let now = Instant::now();
        Self {
            id,
            role,
            connected_at: now,
            config,
            logical_id: Mutex::new(None),
            subscribed_streamer: Mutex::new(None),
            last_activity: Mutex::new(now),
            outbound: Mutex::new(OutboundQueue::new(config.outbound_capacity)),
            outbound_notify: Notify::new(),
            close_notify: Notify::new(),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn logical_id(&self) -> Option<String> {
        self.logical_id.lock().unwrap().clone()
    }

    pub fn set_logical_id(&self, id: String) {
        *self.logical_id.lock().unwrap() = Some(id);
    }

    pub fn subscribed_streamer(&self) -> Option<ConnectionId> {
        *self.subscribed_streamer.lock().unwrap()
    }

    pub fn set_subscribed_streamer(&self, streamer: Option<ConnectionId>) {
        *self.subscribed_streamer.lock().unwrap() = streamer;
    }

    /// Non-blocking enqueue. Returns `false` if the message was dropped
    /// (either because an older non-critical message made room, or because
    /// the queue was saturated with critical messages). Every drop — eviction
    /// or outright rejection — bumps `Metrics::queue_full_dropped`.
    pub fn send(&self, envelope: &Envelope) -> bool {
        if self.is_closed() {
            tracing::trace!(conn_id = %self.id, err = %BrokerError::SocketClosed, "dropping send");
            return false;
        }
        let critical = matches!(envelope.msg_type.as_str(), "error" | "disconnect");
        let queued = QueuedMessage {
            wire: Message::Text(envelope.serialize().into()),
            critical,
        };
        let outcome = self.outbound.lock().unwrap().push(queued);
        self.outbound_notify.notify_one();
        match outcome {
            EnqueueOutcome::Enqueued => true,
            EnqueueOutcome::DroppedOldest => {
                self.metrics.queue_full_dropped();
                true
            }
            EnqueueOutcome::Rejected => {
                tracing::debug!(conn_id = %self.id, err = %BrokerError::QueueFull, "dropping message");
                self.metrics.queue_full_dropped();
                false
            }
        }
    }

    /// Called by the writer task: blocks until a message is queued or the
    /// connection is asked to close.
    pub async fn next_outbound(&self) -> Option<Message> {
        loop {
            if let Some(msg) = self.outbound.lock().unwrap().pop() {
                return Some(msg.wire);
            }
            if self.is_closed() {
                // Drain whatever is left, then stop.
                return self.outbound.lock().unwrap().pop().map(|m| m.wire);
            }
            tokio::select! {
                _ = self.outbound_notify.notified() => {}
                _ = self.close_notify.notified() => {}
            }
        }
    }

    pub fn close_signal(&self) -> &Notify {
        &self.close_notify
    }

    /// Idempotent. Marks the connection closed and wakes the writer so it
    /// can drain within `CLOSE_DRAIN_WINDOW` before the socket hard-closes.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_notify.notify_waiters();
        self.outbound_notify.notify_one();
    }

    #[cfg(test)]
    pub fn has_outbound(&self) -> bool {
        !self.outbound.lock().unwrap().messages.is_empty()
    }

    /// Test-only synchronous pop, for asserting on what a role handler
    /// enqueued without spinning up a real writer task.
    #[cfg(test)]
    pub fn next_outbound_now(&self) -> String {
        let msg = self
            .outbound
            .lock()
            .unwrap()
            .pop()
            .expect("expected a queued outbound message");
        match msg.wire {
            Message::Text(t) => t.to_string(),
            _ => panic!("expected text message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_protocol::canonical;

    fn conn(capacity: usize) -> Connection {
        Connection::new(
            ConnectionId::new_v4(),
            Role::Player,
            ConnectionConfig {
                outbound_capacity: capacity,
                ping_interval: Duration::from_secs(30),
                connection_timeout: Duration::from_secs(60),
            },
            Arc::new(crate::metrics::AtomicMetrics::new()),
        )
    }

    #[test]
    fn close_is_idempotent() {
        let c = conn(4);
        c.close();
        c.close();
        assert!(c.is_closed());
    }

    #[test]
    fn send_after_close_is_dropped() {
        let c = conn(4);
        c.close();
        assert!(!c.send(&canonical::ping()));
    }

    #[test]
    fn queue_full_drops_oldest_non_critical() {
        let c = conn(2);
        assert!(c.send(&canonical::player_count(1)));
        assert!(c.send(&canonical::player_count(2)));
        // queue full of non-critical messages — the new one evicts the oldest
        assert!(c.send(&canonical::player_count(3)));
        let mut queue = c.outbound.lock().unwrap();
        assert_eq!(queue.messages.len(), 2);
        match &queue.pop().unwrap().wire {
            Message::Text(t) => assert!(t.contains("\"count\":2")),
            _ => panic!("expected text message"),
        }
    }

    #[test]
    fn critical_messages_are_never_evicted_by_non_critical() {
        let c = conn(1);
        assert!(c.send(&canonical::error("boom")));
        // queue full of a critical message; a non-critical send can't evict it
        assert!(!c.send(&canonical::player_count(1)));
        let mut queue = c.outbound.lock().unwrap();
        assert_eq!(queue.messages.len(), 1);
        match &queue.pop().unwrap().wire {
            Message::Text(t) => assert!(t.contains("\"type\":\"error\"")),
            _ => panic!("expected text message"),
        }
    }

    #[test]
    fn queue_full_drop_increments_metrics() {
        let metrics = Arc::new(crate::metrics::AtomicMetrics::new());
        let c = Connection::new(
            ConnectionId::new_v4(),
            Role::Player,
            ConnectionConfig {
                outbound_capacity: 1,
                ping_interval: Duration::from_secs(30),
                connection_timeout: Duration::from_secs(60),
            },
            Arc::clone(&metrics),
        );
        // eviction: queue full of non-critical messages
        assert!(c.send(&canonical::player_count(1)));
        assert!(c.send(&canonical::player_count(2)));
        // outright rejection: queue full of a critical message
        assert!(c.send(&canonical::error("boom")));
        assert!(!c.send(&canonical::player_count(3)));

        // 3 drops total: the eviction above, the error's own eviction of the
        // message it replaced, and the final outright rejection.
        let text = metrics.render_prometheus(Instant::now());
        assert!(text.contains("broker_queue_full_drops_total 3"));
    }

    #[test]
    fn last_activity_is_monotonic() {
        let c = conn(4);
        let first = c.last_activity();
        c.touch();
        assert!(c.last_activity() >= first);
    }

    #[tokio::test]
    async fn next_outbound_returns_queued_message() {
        let c = conn(4);
        c.send(&canonical::ping());
        let msg = c.next_outbound().await.unwrap();
        match msg {
            Message::Text(t) => assert!(t.contains("\"type\":\"ping\"")),
            _ => panic!("expected text message"),
        }
    }

    #[tokio::test]
    async fn next_outbound_drains_then_stops_after_close() {
        let c = conn(4);
        c.send(&canonical::ping());
        c.close();
        assert!(c.next_outbound().await.is_some());
        assert!(c.next_outbound().await.is_none());
    }
}
