macro_rules! invariant {
    ($cond:expr, $($arg:tt)*) => {
        if cfg!(debug_assertions) && !$cond {
            panic!($($arg)*);
        }
    };
}

pub mod observer;
mod queue;
mod timer;
mod wake;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tarry_metrics::{ClientDepth, QueueDepths};
use uuid::Uuid;

use crate::observer::{BrokerObserver, NoopObserver};
use crate::queue::ClientQueue;
use crate::timer::ReservationTimers;

pub use crate::wake::PendingPoll;

/// Broker-assigned message identifier, shared by every client's copy.
pub type MessageId = Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("unknown client {0}")]
    UnknownClient(String),

    #[error("no live reservation for message {message_id} of client {client}")]
    ReservationExpired {
        client: String,
        message_id: MessageId,
    },

    #[error("unacked entry {0} has no payload")]
    MissingPayload(MessageId),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub reservation_timeout_ms: u64,
    /// Per-client unacked backlog limit, 0 means unbounded.
    pub max_backlog_per_client: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            reservation_timeout_ms: 60_000,
            max_backlog_per_client: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }
}

/// One message handed to one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub payload: Bytes,
}

#[derive(Debug)]
pub enum PollOutcome {
    Ready(Delivery),
    Parked(PendingPoll),
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: BrokerConfig,
    pub(crate) observer: Arc<dyn BrokerObserver>,
    pub(crate) timers: ReservationTimers,
}

/// In-memory fan-out broker with long-poll delivery and per-message
/// reservations.
///
/// All operations are synchronous and cheap; parked polls are plain
/// [`PendingPoll`] values. Reservation deadlines are tokio tasks, so the
/// broker must be used from within a tokio runtime.
#[derive(Debug)]
pub struct Broker {
    shared: Arc<Shared>,
    clients: DashMap<String, Arc<ClientQueue>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(config: BrokerConfig, observer: Arc<dyn BrokerObserver>) -> Self {
        let timers = ReservationTimers::new(config.reservation_timeout());
        Broker {
            shared: Arc::new(Shared {
                config,
                observer,
                timers,
            }),
            clients: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Makes the client a fan-out target without polling.
    pub fn register_client(&self, client: &str) {
        self.client(client);
    }

    pub fn is_known(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Fans the payload out to every known client and wakes their parked
    /// polls. Never fails; clients over their backlog limit drop their
    /// oldest message instead.
    pub fn publish(&self, payload: impl Into<Bytes>) -> MessageId {
        let message_id = Uuid::now_v7();
        let payload = payload.into();

        // snapshot so no shard lock is held while client queues are locked
        let targets: Vec<Arc<ClientQueue>> =
            self.clients.iter().map(|e| e.value().clone()).collect();

        for queue in &targets {
            queue.append(message_id, payload.clone());
        }
        self.shared.observer.on_published();
        tracing::debug!(%message_id, clients = targets.len(), "published");

        for queue in &targets {
            queue.wake();
        }

        message_id
    }

    /// Reserves the client's next message, or parks a long poll when there
    /// is nothing to deliver. Registers the client on first contact.
    pub fn poll(&self, client: &str) -> PollOutcome {
        self.client(client).poll()
    }

    /// Like [`Broker::poll`] but waits for a parked poll to resolve.
    /// Dropping the returned future cancels the wait.
    pub async fn poll_wait(&self, client: &str) -> Option<Delivery> {
        match self.poll(client) {
            PollOutcome::Ready(delivery) => Some(delivery),
            PollOutcome::Parked(pending) => pending.recv().await,
        }
    }

    pub fn ack(&self, client: &str, message_id: MessageId) -> Result<(), BrokerError> {
        let queue = self
            .clients
            .get(client)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                self.shared.observer.on_ack_rejected(client);
                BrokerError::UnknownClient(client.to_string())
            })?;

        queue.ack(message_id)
    }

    /// Per-client depths, sorted by client name.
    pub fn client_depths(&self) -> Vec<ClientDepth> {
        let queues: Vec<Arc<ClientQueue>> =
            self.clients.iter().map(|e| e.value().clone()).collect();

        let mut depths: Vec<ClientDepth> = queues.iter().map(|q| q.depth()).collect();
        depths.sort_by(|a, b| a.client.cmp(&b.client));
        depths
    }

    /// Cancels every armed reservation deadline and resolves parked polls
    /// empty. Messages stay where they are; nothing is redelivered after
    /// this point.
    pub fn shutdown(&self) {
        self.shared.timers.shutdown();

        let queues: Vec<Arc<ClientQueue>> =
            self.clients.iter().map(|e| e.value().clone()).collect();
        for queue in queues {
            queue.close_waiters();
        }

        tracing::info!(clients = self.clients.len(), "broker shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.timers.is_shutdown()
    }

    fn client(&self, client: &str) -> Arc<ClientQueue> {
        if let Some(queue) = self.clients.get(client) {
            return queue.value().clone();
        }

        self.clients
            .entry(client.to_string())
            .or_insert_with(|| {
                tracing::info!(client, "new client");
                Arc::new(ClientQueue::new(client, self.shared.clone()))
            })
            .value()
            .clone()
    }
}

impl QueueDepths for Broker {
    fn queue_depths(&self) -> Vec<ClientDepth> {
        self.client_depths()
    }
}
