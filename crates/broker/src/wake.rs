use std::sync::{Arc, Weak};

use tokio::sync::oneshot;

use crate::Delivery;
use crate::queue::{ClientQueue, WaiterId};

/// A long poll that found nothing to deliver and is parked on its client.
///
/// The poll resolves when a publish or an expired reservation makes a
/// message available to it. Dropping it, or dropping the future returned by
/// [`PendingPoll::recv`], counts as a disconnect: the waiter is removed and
/// a message already handed to it but never read goes back to the head of
/// the client's queue.
#[derive(Debug)]
pub struct PendingPoll {
    client: Arc<str>,
    waiter_id: WaiterId,
    rx: oneshot::Receiver<Delivery>,
    queue: Weak<ClientQueue>,
    settled: bool,
}

impl PendingPoll {
    pub(crate) fn new(
        queue: &Arc<ClientQueue>,
        waiter_id: WaiterId,
        rx: oneshot::Receiver<Delivery>,
    ) -> Self {
        Self {
            client: Arc::from(queue.name()),
            waiter_id,
            rx,
            queue: Arc::downgrade(queue),
            settled: false,
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn waiter_id(&self) -> u64 {
        self.waiter_id
    }

    /// Waits for the delivery. `None` means the broker shut down.
    pub async fn recv(mut self) -> Option<Delivery> {
        let delivery = (&mut self.rx).await.ok();
        self.settled = true;
        delivery
    }

    /// Takes the delivery if it has already arrived.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(delivery) => {
                self.settled = true;
                Some(delivery)
            }
            Err(_) => None,
        }
    }
}

impl Drop for PendingPoll {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        // closing first means a later send fails on the waker's side, so
        // the message is requeued by exactly one of us
        self.rx.close();
        let undelivered = self.rx.try_recv().ok();

        if let Some(queue) = self.queue.upgrade() {
            queue.abandon(self.waiter_id, undelivered);
        }
    }
}
