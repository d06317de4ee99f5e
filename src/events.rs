//! Typed event taxonomy and dispatcher. Handlers are plain closures registered against an
//! [`EventBus`]; dispatch is synchronous-per-handler (each handler runs to completion
//! before the next starts) and concurrent-across-handlers only when `Config::synchronous_ack`
//! is false, mirroring the teacher's own handler-registration shape in `handlers/` but
//! without the axum routing layer around it.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::jid::Jid;

/// Connection lifecycle and protocol-level occurrences a caller can subscribe to.
#[derive(Debug, Clone)]
pub enum Event {
    /// A QR payload ready to be displayed for scanning; carries the raw string, the
    /// rotation index (0-based), and the generation wall-clock deadline is left to the
    /// caller, not encoded here.
    QrCode { payload: String, rotation: u32 },
    /// Pairing completed and the device now has a durable JID.
    Paired { jid: Jid },
    /// Transport connected and the Noise handshake completed.
    Connected,
    /// Transport disconnected, with a flag for whether a reconnect attempt will follow.
    Disconnected { will_reconnect: bool },
    /// A plaintext chat message was decrypted successfully.
    Message { from: Jid, id: String, plaintext: Vec<u8> },
    /// Inbound decryption failed; a retry receipt may be sent depending on policy.
    DecryptionFailure { from: Jid, id: String, reason: String },
    /// The remote identity key for `address` changed and was rejected under the current
    /// trust policy.
    IdentityChanged { address: String },
    /// A server-pushed app-state/contact/chat-settings mutation arrived.
    StateSync { key: String },
    /// The server permanently logged this device out (conflict, revoked linked device, or
    /// a fatal stream error). No further reconnect attempts follow.
    LoggedOut,
    /// A pairing attempt failed terminally (QR exhaustion, a bad account signature, or a
    /// server rejection) and the pairing state machine reset to `unpaired`.
    PairError { reason: String },
}

type Handler = Arc<dyn Fn(Event) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Registry of event handlers plus the dispatch policy.
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Handler>>>,
    synchronous: bool,
}

impl EventBus {
    pub fn new(synchronous: bool) -> Self {
        Self { handlers: Arc::new(RwLock::new(Vec::new())), synchronous }
    }

    /// Registers a handler. `f` must return a future boxed by the caller (via
    /// `Box::pin(async move { .. })`) since handlers can be arbitrarily async.
    pub async fn subscribe<F, Fut>(&self, f: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |event| Box::pin(f(event)));
        self.handlers.write().await.push(wrapped);
    }

    /// Dispatches `event` to every registered handler. When `synchronous` is true, each
    /// handler completes before the next begins and before this call returns — giving the
    /// caller a completion guarantee useful for acking server stanzas only after local
    /// processing finished. When false, handlers run concurrently and this call still
    /// awaits all of them, but none observes another's side effects mid-flight.
    pub async fn dispatch(&self, event: Event) {
        let handlers = self.handlers.read().await.clone();
        if self.synchronous {
            for handler in handlers {
                handler(event.clone()).await;
            }
        } else {
            let futures = handlers.into_iter().map(|handler| handler(event.clone()));
            futures::future::join_all(futures).await;
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatch_reaches_every_handler() {
        let bus = EventBus::new(true);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            bus.subscribe(move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        }

        bus.dispatch(Event::Connected).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn synchronous_mode_awaits_each_handler_in_turn() {
        let bus = EventBus::new(true);
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(move |_event| {
                let order = order.clone();
                async move {
                    order.lock().await.push(i);
                }
            })
            .await;
        }

        bus.dispatch(Event::Connected).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
