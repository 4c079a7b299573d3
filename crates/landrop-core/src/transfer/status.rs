//! Ordered fan-out of transfer status changes.
//!
//! Every event goes through [`StatusHub::dispatch`], which applies it to the
//! [`TransferSession`] and queues the resulting transition to every live
//! subscriber while still holding the lock. Subscribers therefore observe
//! every transition exactly once, in the order events arrived. The single
//! current value is also available through [`StatusHub::current`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, watch};

use super::{Outcome, SessionEvent, TransferSession, TransferStatus};

struct HubInner {
    session: TransferSession,
    subscribers: Vec<(u64, mpsc::UnboundedSender<TransferStatus>)>,
    next_id: u64,
}

/// Owner of the transfer session and its observers.
pub struct StatusHub {
    inner: Mutex<HubInner>,
    current: watch::Sender<TransferStatus>,
}

impl std::fmt::Debug for StatusHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusHub")
            .field("current", &*self.current.borrow())
            .finish_non_exhaustive()
    }
}

impl StatusHub {
    /// Create a hub whose session starts disconnected.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (current, _) = watch::channel(TransferStatus::Disconnected);
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                session: TransferSession::new(),
                subscribers: Vec::new(),
                next_id: 0,
            }),
            current,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply an event and publish the transition, if any.
    pub fn dispatch(&self, event: SessionEvent) -> Outcome {
        let mut inner = self.lock();
        let outcome = inner.session.apply(event);

        if let Outcome::Transition(status) = &outcome {
            inner
                .subscribers
                .retain(|(_, tx)| tx.send(status.clone()).is_ok());
            self.current.send_replace(status.clone());
        }

        outcome
    }

    /// The current status.
    #[must_use]
    pub fn current(&self) -> TransferStatus {
        self.current.borrow().clone()
    }

    /// Subscribe to every future transition.
    pub fn subscribe(self: &Arc<Self>) -> StatusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, tx));

        StatusSubscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|(sub_id, _)| *sub_id != id);
    }
}

/// A live subscription to status transitions.
///
/// Dropping it (or calling [`StatusSubscription::unsubscribe`]) detaches it
/// from the hub.
#[derive(Debug)]
pub struct StatusSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<TransferStatus>,
    hub: Weak<StatusHub>,
}

impl StatusSubscription {
    /// Wait for the next transition; `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<TransferStatus> {
        self.rx.recv().await
    }

    /// Take the next queued transition without waiting.
    pub fn try_recv(&mut self) -> Option<TransferStatus> {
        self.rx.try_recv().ok()
    }

    /// Detach from the hub.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}
