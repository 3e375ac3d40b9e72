use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tarry_metrics::ClientDepth;
use tokio::sync::oneshot;

use crate::timer::DeadlineHandle;
use crate::wake::PendingPoll;
use crate::{BrokerError, Delivery, MessageId, PollOutcome, Shared};

pub(crate) type WaiterId = u64;

#[derive(Debug)]
struct Reservation {
    payload: Bytes,
    // bumped on every reservation so a late deadline for an older
    // reservation of the same message is ignored
    lease: u64,
    deadline: DeadlineHandle,
}

#[derive(Debug, Default)]
struct ClientState {
    unacked_order: VecDeque<MessageId>,
    unacked: HashMap<MessageId, Bytes>,
    reserved: HashMap<MessageId, Reservation>,
    waiters: BTreeMap<WaiterId, oneshot::Sender<Delivery>>,
    next_lease: u64,
}

/// State of a single subscriber.
///
/// Every compound mutation runs with `state` locked. The lock is never held
/// across an await point; arming a deadline only spawns a task.
#[derive(Debug)]
pub(crate) struct ClientQueue {
    name: Arc<str>,
    shared: Arc<Shared>,
    state: Mutex<ClientState>,
    next_waiter: AtomicU64,
}

impl ClientQueue {
    pub(crate) fn new(name: &str, shared: Arc<Shared>) -> Self {
        Self {
            name: Arc::from(name),
            shared,
            state: Mutex::new(ClientState::default()),
            next_waiter: AtomicU64::new(1),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Appends one published message, evicting from the head while the
    /// backlog is over its limit.
    pub(crate) fn append(&self, message_id: MessageId, payload: Bytes) {
        let mut state = self.state.lock();
        state.unacked.insert(message_id, payload);
        state.unacked_order.push_back(message_id);

        let max_backlog = self.shared.config.max_backlog_per_client;
        if max_backlog == 0 {
            return;
        }

        while state.unacked_order.len() > max_backlog {
            let Some(oldest) = state.unacked_order.pop_front() else {
                break;
            };
            state.unacked.remove(&oldest);
            self.shared.observer.on_dropped(&self.name);
            tracing::debug!(client = %self.name, message_id = %oldest, "backlog full, dropped oldest");
        }
    }

    pub(crate) fn poll(self: &Arc<Self>) -> PollOutcome {
        let mut state = self.state.lock();

        if let Some(delivery) = self.next_delivery_locked(&mut state) {
            return PollOutcome::Ready(delivery);
        }

        let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        // after shutdown the poll resolves empty right away
        if !self.shared.timers.is_shutdown() {
            state.waiters.insert(waiter_id, tx);
            tracing::debug!(client = %self.name, waiter_id, "poll parked");
        }

        PollOutcome::Parked(PendingPoll::new(self, waiter_id, rx))
    }

    pub(crate) fn ack(&self, message_id: MessageId) -> Result<(), BrokerError> {
        let mut state = self.state.lock();

        let Some(reservation) = state.reserved.remove(&message_id) else {
            self.shared.observer.on_ack_rejected(&self.name);
            return Err(BrokerError::ReservationExpired {
                client: self.name.to_string(),
                message_id,
            });
        };

        reservation.deadline.cancel();
        self.shared.observer.on_acked(&self.name);
        tracing::debug!(client = %self.name, %message_id, "acked");
        Ok(())
    }

    /// Deadline path: returns an expired reservation to the tail of the
    /// unacked queue and wakes this client's waiters.
    pub(crate) fn unreserve(self: &Arc<Self>, message_id: MessageId, lease: u64) {
        let mut state = self.state.lock();

        match state.reserved.get(&message_id) {
            Some(reservation) if reservation.lease == lease => {}
            // acked, abandoned or re-reserved in the meantime
            _ => return,
        }
        let Some(reservation) = state.reserved.remove(&message_id) else {
            return;
        };

        invariant!(
            !state.unacked.contains_key(&message_id),
            "message {message_id} is both reserved and unacked"
        );

        state.unacked.insert(message_id, reservation.payload);
        state.unacked_order.push_back(message_id);
        self.shared.observer.on_unreserved(&self.name);
        tracing::debug!(client = %self.name, %message_id, "reservation expired, requeued");

        self.wake_locked(&mut state);
    }

    pub(crate) fn wake(self: &Arc<Self>) {
        let mut state = self.state.lock();
        self.wake_locked(&mut state);
    }

    /// Drops a parked poll whose caller went away. A delivery the caller
    /// never consumed goes back to the head of the queue.
    pub(crate) fn abandon(self: &Arc<Self>, waiter_id: WaiterId, undelivered: Option<Delivery>) {
        let mut state = self.state.lock();
        state.waiters.remove(&waiter_id);

        let Some(delivery) = undelivered else {
            tracing::debug!(client = %self.name, waiter_id, "parked poll disconnected");
            return;
        };

        if self.requeue_front_locked(&mut state, delivery.message_id) {
            tracing::debug!(
                client = %self.name,
                waiter_id,
                message_id = %delivery.message_id,
                "poll disconnected before delivery, requeued"
            );
            self.wake_locked(&mut state);
        }
    }

    /// Drops every parked waiter; their pending polls resolve empty.
    pub(crate) fn close_waiters(&self) {
        self.state.lock().waiters.clear();
    }

    pub(crate) fn depth(&self) -> ClientDepth {
        let state = self.state.lock();
        ClientDepth {
            client: self.name.to_string(),
            unacked: state.unacked_order.len(),
            reserved: state.reserved.len(),
            waiters: state.waiters.len(),
        }
    }

    /// Hands available messages to parked waiters.
    ///
    /// Every waiter is taken out of the map first. Waiters whose caller is
    /// gone are dropped; the rest either get the next message or are parked
    /// again under the same id once the queue runs dry.
    fn wake_locked(self: &Arc<Self>, state: &mut ClientState) {
        if state.waiters.is_empty() {
            return;
        }

        let waiters = std::mem::take(&mut state.waiters);
        for (waiter_id, tx) in waiters {
            if tx.is_closed() {
                continue;
            }

            let Some(delivery) = self.next_delivery_locked(state) else {
                state.waiters.insert(waiter_id, tx);
                continue;
            };

            if let Err(delivery) = tx.send(delivery) {
                // receiver closed between the check and the send
                self.requeue_front_locked(state, delivery.message_id);
            }
        }
    }

    fn next_delivery_locked(self: &Arc<Self>, state: &mut ClientState) -> Option<Delivery> {
        loop {
            match self.dequeue_locked(state) {
                Ok(delivery) => return delivery,
                Err(err) => {
                    tracing::warn!(client = %self.name, %err, "skipping stale unacked entry");
                }
            }
        }
    }

    /// Pops the head of the unacked queue into `reserved` and arms its
    /// deadline. `Ok(None)` means the queue is empty.
    fn dequeue_locked(
        self: &Arc<Self>,
        state: &mut ClientState,
    ) -> Result<Option<Delivery>, BrokerError> {
        let Some(message_id) = state.unacked_order.pop_front() else {
            return Ok(None);
        };
        let Some(payload) = state.unacked.remove(&message_id) else {
            return Err(BrokerError::MissingPayload(message_id));
        };

        state.next_lease += 1;
        let lease = state.next_lease;

        let queue = Arc::downgrade(self);
        let deadline = self.shared.timers.arm(move || {
            if let Some(queue) = queue.upgrade() {
                queue.unreserve(message_id, lease);
            }
        });

        state.reserved.insert(
            message_id,
            Reservation {
                payload: payload.clone(),
                lease,
                deadline,
            },
        );
        self.shared.observer.on_pulled(&self.name);
        tracing::debug!(client = %self.name, %message_id, "reserved");

        Ok(Some(Delivery {
            message_id,
            payload,
        }))
    }

    fn requeue_front_locked(&self, state: &mut ClientState, message_id: MessageId) -> bool {
        let Some(reservation) = state.reserved.remove(&message_id) else {
            return false;
        };

        reservation.deadline.cancel();
        state.unacked.insert(message_id, reservation.payload);
        state.unacked_order.push_front(message_id);
        true
    }
}
