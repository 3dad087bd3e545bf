//! Rendezvous channel used to deliver candidacy events to the reconciler.
//!
//! Tokio has no zero-capacity channel, so rendezvous semantics are built from
//! a queue of acknowledged slots: `send` parks the value and completes only
//! once the receiver has taken it (or discarded it via [`Receiver::drain`]).
//! The queue length is therefore the number of producers currently blocked,
//! which is exactly the count the reconciler's drain step needs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Notify};

/// Creates a linked sender/receiver pair.
///
/// Senders are cheap to clone; the receiver is unique.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::new(),
            senders: 1,
            closed: false,
        }),
        notify: Notify::new(),
    });

    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// The receiving half was dropped; the event can never be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event channel closed")]
pub struct SendError;

struct Slot<T> {
    value: T,
    ack: oneshot::Sender<()>,
}

struct Inner<T> {
    queue: VecDeque<Slot<T>>,
    senders: usize,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer half. One logical producer per backend plus the reconciler's
/// own error-injection path; all of them block until their event is taken.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Delivers one event, completing when the receiver accepts or drains it.
    pub async fn send(&self, value: T) -> Result<(), SendError> {
        let ack_rx = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(SendError);
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            inner.queue.push_back(Slot {
                value,
                ack: ack_tx,
            });
            ack_rx
        };
        self.shared.notify.notify_one();

        // Resolved on receive or drain; dropped if the receiver goes away.
        ack_rx.await.map_err(|_| SendError)
    }

    /// Number of events currently parked in the channel.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Sender {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.shared.lock().senders -= 1;
        self.shared.notify.notify_one();
    }
}

/// Consumer half, owned by the reconciler.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Takes the next event, waking its sender. Returns `None` once every
    /// sender has been dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut inner = self.shared.lock();
                if let Some(slot) = inner.queue.pop_front() {
                    let _ = slot.ack.send(());
                    return Some(slot.value);
                }
                if inner.senders == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Removes every currently-parked event, waking the blocked senders.
    /// Events that arrive after this call are untouched.
    pub fn drain(&mut self) -> Vec<T> {
        let slots: Vec<Slot<T>> = self.shared.lock().queue.drain(..).collect();
        slots
            .into_iter()
            .map(|slot| {
                let _ = slot.ack.send(());
                slot.value
            })
            .collect()
    }

    /// Number of events currently parked in the channel.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.closed = true;
        // Dropping the slots drops their acks, failing the parked sends.
        inner.queue.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
