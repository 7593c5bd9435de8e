use std::sync::Arc;
use std::time::Instant;

use broker_protocol::BrokerConfig;

use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::subscription::SubscriptionGraph;

/// Process-wide state shared across every connection. Passed around as an
/// `Arc<BrokerState>` rather than held in globals, so multiple brokers could
/// run in the same process (e.g. in tests) without interfering.
pub struct BrokerState {
    pub config: BrokerConfig,
    pub registry: Registry,
    pub subscriptions: SubscriptionGraph,
    pub metrics: Arc<dyn Metrics>,
    pub started_at: Instant,
}

impl BrokerState {
    pub fn new(config: BrokerConfig, metrics: Arc<dyn Metrics>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            subscriptions: SubscriptionGraph::new(),
            metrics,
            started_at: Instant::now(),
        })
    }
}
