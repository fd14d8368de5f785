use crate::model::{OrderId, Timestamp};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The previous timer for this order has already fired; arming again would
/// race with the in-flight timeout event.
#[derive(thiserror::Error, Debug)]
#[error("Timer for order {0} has already fired")]
pub struct AlreadyTimedOut(pub OrderId);

struct Timer {
    handle: JoinHandle<()>,
    deadline: Timestamp,
}

/// Cancellable one-shot deadline timers keyed by order id. On expiry the
/// timer delivers `event` into the owning task's queue; timers must be
/// cancelled when the timed state is left so they cannot fire spuriously.
pub struct TimeoutScheduler<E> {
    sender: mpsc::Sender<E>,
    timers: HashMap<OrderId, Timer>,
}

impl<E: Send + 'static> TimeoutScheduler<E> {
    pub fn new(sender: mpsc::Sender<E>) -> Self {
        Self {
            sender,
            timers: HashMap::new(),
        }
    }

    /// Arms a timer firing `early` before `deadline`. The early margin
    /// absorbs clock skew for deadlines set by remote parties.
    pub fn arm(
        &mut self,
        order_id: OrderId,
        deadline: Timestamp,
        early: Duration,
        event: E,
    ) -> Result<(), AlreadyTimedOut> {
        if let Some(timer) = self.timers.get(&order_id) {
            if timer.handle.is_finished() {
                return Err(AlreadyTimedOut(order_id));
            }
        }

        self.cancel(order_id);

        let delay = deadline.until().saturating_sub(early);
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(event).await;
        });

        tracing::trace!(%order_id, %deadline, "Armed timeout");

        self.timers.insert(order_id, Timer { handle, deadline });

        Ok(())
    }

    pub fn cancel(&mut self, order_id: OrderId) {
        if let Some(timer) = self.timers.remove(&order_id) {
            timer.handle.abort();
        }
    }

    pub fn deadline(&self, order_id: OrderId) -> Option<Timestamp> {
        self.timers.get(&order_id).map(|timer| timer.deadline)
    }
}

impl<E> Drop for TimeoutScheduler<E> {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.handle.abort();
        }
    }
}
