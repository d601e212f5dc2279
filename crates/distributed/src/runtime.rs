//! Minimal tokio actor runtime hosting the result coordinator and its sinks.
//!
//! Each actor owns an unbounded mailbox and processes one [`Envelope`] at a
//! time. Messages addressed to an unregistered actor are reported back to the
//! sender as [`Message::Undelivered`] when the message kind allows it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dqr_common::ActorId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::ResultCoordinator;
use crate::messages::{Message, Outbox, Undelivered};

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: ActorId,
    pub message: Message,
}

pub type Mailbox = mpsc::UnboundedReceiver<Envelope>;

/// Registry of live mailboxes, shared by every actor in one runtime.
#[derive(Debug, Clone, Default)]
pub struct ActorRouter {
    inner: Arc<RouterInner>,
}

#[derive(Debug, Default)]
struct RouterInner {
    next_id: AtomicU64,
    mailboxes: RwLock<HashMap<ActorId, mpsc::UnboundedSender<Envelope>>>,
}

impl ActorRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an identity and its mailbox.
    pub fn register(&self) -> (ActorId, Mailbox) {
        let id = ActorId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .mailboxes
            .write()
            .expect("router lock poisoned")
            .insert(id, tx);
        (id, rx)
    }

    pub fn deregister(&self, id: ActorId) {
        self.inner
            .mailboxes
            .write()
            .expect("router lock poisoned")
            .remove(&id);
    }

    pub fn is_registered(&self, id: ActorId) -> bool {
        self.inner
            .mailboxes
            .read()
            .expect("router lock poisoned")
            .contains_key(&id)
    }

    /// Deliver `message` to `to`, bouncing it to `from` when `to` is gone.
    pub fn send(&self, from: ActorId, to: ActorId, message: Message) {
        let Err((reason, message)) = self.try_deliver(from, to, message) else {
            return;
        };
        debug!(from = %from, to = %to, kind = message.kind(), reason, "message undelivered");
        if !message.bounces_when_undelivered() {
            return;
        }
        let report = Message::Undelivered(Undelivered {
            from: to,
            to: from,
            reason: reason.to_string(),
            message_kind: message.kind(),
        });
        // the runtime itself reports the failure; nothing bounces a bounce
        let _ = self.try_deliver(to, from, report);
    }

    fn try_deliver(
        &self,
        from: ActorId,
        to: ActorId,
        message: Message,
    ) -> std::result::Result<(), (&'static str, Message)> {
        let mailboxes = self.inner.mailboxes.read().expect("router lock poisoned");
        let Some(tx) = mailboxes.get(&to) else {
            return Err(("ActorUnknown", message));
        };
        tx.send(Envelope {
            sender: from,
            message,
        })
        .map_err(|e| ("MailboxClosed", e.0.message))
    }

    /// Outbox sending on behalf of `from`.
    pub fn outbox(&self, from: ActorId) -> RouterOutbox<'_> {
        RouterOutbox { router: self, from }
    }
}

pub struct RouterOutbox<'a> {
    router: &'a ActorRouter,
    from: ActorId,
}

impl Outbox for RouterOutbox<'_> {
    fn send(&mut self, to: ActorId, message: Message) {
        self.router.send(self.from, to, message);
    }
}

/// A spawned actor.
#[derive(Debug)]
pub struct ActorHandle {
    pub id: ActorId,
    pub join: JoinHandle<()>,
}

/// Run `coordinator` as an actor until it has sent its final response.
pub fn spawn_result_coordinator(
    router: &ActorRouter,
    id: ActorId,
    mut mailbox: Mailbox,
    mut coordinator: ResultCoordinator,
) -> ActorHandle {
    let router = router.clone();
    let join = tokio::spawn(async move {
        debug!(coordinator = %id, "result coordinator started");
        while let Some(envelope) = mailbox.recv().await {
            let mut out = router.outbox(id);
            coordinator.handle(envelope.sender, envelope.message, &mut out);
            if coordinator.is_finished() {
                break;
            }
        }
        router.deregister(id);
        info!(coordinator = %id, "result coordinator stopped");
    });
    ActorHandle { id, join }
}
