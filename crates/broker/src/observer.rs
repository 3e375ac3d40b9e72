use tarry_metrics::BrokerStats;

/// Fire-and-forget notifications emitted by the broker core.
///
/// Implementations are called while a client's queue is locked, so they must
/// return quickly and must never call back into the broker.
pub trait BrokerObserver: Send + Sync + std::fmt::Debug {
    fn on_published(&self) {}
    fn on_pulled(&self, _client: &str) {}
    fn on_acked(&self, _client: &str) {}
    fn on_unreserved(&self, _client: &str) {}
    fn on_dropped(&self, _client: &str) {}
    fn on_ack_rejected(&self, _client: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl BrokerObserver for NoopObserver {}

impl BrokerObserver for BrokerStats {
    fn on_published(&self) {
        self.published();
    }

    fn on_pulled(&self, client: &str) {
        self.pulled(client);
    }

    fn on_acked(&self, client: &str) {
        self.acked(client);
    }

    fn on_unreserved(&self, client: &str) {
        self.unreserved(client);
    }

    fn on_dropped(&self, client: &str) {
        self.dropped(client);
    }

    fn on_ack_rejected(&self, _client: &str) {
        self.ack_rejected();
    }
}
