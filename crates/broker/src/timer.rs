use std::time::Duration;

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Arms single-shot reservation deadlines on the tokio timer wheel.
///
/// Every armed deadline also listens on the broker-wide shutdown token, so a
/// shut down broker never fires a stale reservation.
#[derive(Debug, Clone)]
pub(crate) struct ReservationTimers {
    timeout: Duration,
    shutdown: CancellationToken,
}

impl ReservationTimers {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs `on_fire` once the reservation timeout elapses, unless the
    /// returned handle is cancelled first. Must be called from within a tokio
    /// runtime.
    pub(crate) fn arm<F>(&self, on_fire: F) -> DeadlineHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = self.timeout;
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => on_fire(),
            }
        });

        DeadlineHandle {
            abort: task.abort_handle(),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Cancellable handle for one armed deadline.
///
/// Cancelling only stops a deadline that has not started firing yet; the
/// fire path re-checks the reservation under the client lock, which is what
/// makes ack and expiry mutually exclusive.
#[derive(Debug)]
pub(crate) struct DeadlineHandle {
    abort: AbortHandle,
}

impl DeadlineHandle {
    pub(crate) fn cancel(self) {
        self.abort.abort();
    }
}
