//! In-process session bus.
//!
//! One bus per session, nothing shared across sessions. Registration yields
//! a single-consumer [`Mailbox`] so each component sees its deliveries
//! in-order, one at a time; broadcasts fan out to every subscriber except
//! the sender; directed sends resolve by identity.
//!
//! Every queued message carries an in-flight guard, released when the
//! receiving loop drops the [`Delivery`]. [`SessionBus::quiescent`] resolves
//! only when nothing is queued and no handler is mid-delivery, which is how
//! the session driver knows a conversation has settled.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::ChatError;
use crate::message::ChatMessage;

#[derive(Default)]
struct IdleTracker {
    in_flight: AtomicUsize,
    notify: Notify,
}

impl IdleTracker {
    fn begin(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }
}

/// Marks one delivery as in flight until dropped.
struct InFlightGuard {
    tracker: Arc<IdleTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.notify.notify_waiters();
        }
    }
}

/// One message taken off a mailbox.
///
/// The session counts as busy until this is dropped. A handler that
/// publishes follow-up messages before letting its current delivery go
/// keeps the in-flight count above zero across the hand-off, so quiescence
/// cannot be observed in the middle of a conversation.
pub struct Delivery {
    pub message: ChatMessage,
    _guard: InFlightGuard,
}

/// Single-consumer receive side handed out by [`SessionBus::register`] and
/// [`SessionBus::subscribe`]. Deliveries arrive in publish order.
pub struct Mailbox {
    receiver: UnboundedReceiver<Delivery>,
}

impl Mailbox {
    /// Waits for the next delivery. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Takes a queued delivery without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

struct Subscriber {
    identity: Option<String>,
    sender: UnboundedSender<Delivery>,
}

/// Per-session broadcast and directed-delivery fabric.
pub struct SessionBus {
    subscribers: Mutex<Vec<Subscriber>>,
    tracker: Arc<IdleTracker>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            tracker: Arc::new(IdleTracker::default()),
        }
    }

    /// Registers a named participant. The mailbox receives every broadcast
    /// from other senders plus directed sends to `identity`.
    pub async fn register(&self, identity: impl Into<String>) -> Mailbox {
        self.attach(Some(identity.into())).await
    }

    /// Attaches an anonymous observer: it receives every broadcast and can
    /// never be addressed directly. The manager subscribes this way, so no
    /// roster identity can collide with it.
    pub async fn subscribe(&self) -> Mailbox {
        self.attach(None).await
    }

    async fn attach(&self, identity: Option<String>) -> Mailbox {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .push(Subscriber { identity, sender });
        Mailbox { receiver }
    }

    /// Delivers `message` to every subscriber except the sender, returning
    /// the number of mailboxes reached. Subscribers whose mailbox has been
    /// dropped are pruned.
    pub async fn broadcast(&self, sender: &str, message: &ChatMessage) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            // A publisher never receives its own broadcast.
            if subscriber.identity.as_deref() == Some(sender) {
                return true;
            }
            let delivery = Delivery {
                message: message.clone(),
                _guard: self.tracker.begin(),
            };
            match subscriber.sender.send(delivery) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Receiver gone; the send error drops the delivery here,
                // which releases its guard.
                Err(_) => false,
            }
        });
        debug!(
            target = "roundtable::bus",
            sender = %sender,
            delivered,
            event = "message_broadcast"
        );
        delivered
    }

    /// Delivers `message` to the one subscriber registered as `identity`.
    pub async fn send_to(&self, identity: &str, message: ChatMessage) -> Result<(), ChatError> {
        let subscribers = self.subscribers.lock().await;
        let Some(subscriber) = subscribers
            .iter()
            .find(|subscriber| subscriber.identity.as_deref() == Some(identity))
        else {
            return Err(ChatError::Delivery(format!(
                "no subscriber registered as '{identity}'"
            )));
        };
        let delivery = Delivery {
            message,
            _guard: self.tracker.begin(),
        };
        subscriber.sender.send(delivery).map_err(|_| {
            ChatError::Delivery(format!("subscriber '{identity}' is no longer receiving"))
        })?;
        debug!(
            target = "roundtable::bus",
            recipient = %identity,
            event = "message_sent"
        );
        Ok(())
    }

    /// Number of deliveries currently queued or being handled.
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once no delivery is queued or being handled.
    pub async fn quiescent(&self) {
        loop {
            // Register interest before checking, or a release between the
            // check and the await would be missed.
            let notified = self.tracker.notify.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}
