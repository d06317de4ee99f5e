//! Correlates outbound `<iq>` stanzas with their eventual response, the way the teacher
//! correlates synthetic request ids in `wa::message::generate_message_id` but scoped to a
//! single-use completion slot per in-flight request instead of a fire-and-forget id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand_core::{OsRng, RngCore};
use tokio::sync::{oneshot, RwLock};

use crate::binary::BinaryNode;
use crate::error::RouterError;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Generates an unpadded RFC4648 base32 id from 5 random bytes (40 bits of entropy),
/// hand-rolled since no base32 crate appears anywhere in the dependency stack this crate
/// draws from.
pub fn generate_request_id() -> String {
    let mut bytes = [0_u8; 5];
    OsRng.fill_bytes(&mut bytes);

    let mut bits: u64 = 0;
    for b in bytes {
        bits = (bits << 8) | b as u64;
    }
    // 5 bytes = 40 bits = exactly 8 base32 symbols, no padding needed.
    (0..8)
        .rev()
        .map(|i| BASE32_ALPHABET[((bits >> (i * 5)) & 0x1F) as usize] as char)
        .collect()
}

type PendingSlot = oneshot::Sender<Result<BinaryNode, RouterError>>;

type Predicate = Arc<dyn Fn(&BinaryNode) -> bool + Send + Sync>;
type UnsolicitedHandler = Arc<dyn Fn(BinaryNode) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Pairs a predicate over inbound nodes with the handler that consumes matches.
#[derive(Clone)]
struct Registration {
    predicate: Predicate,
    handler: UnsolicitedHandler,
}

/// Tracks in-flight `<iq>` requests awaiting a server response, keyed by request id, and
/// routes unsolicited (non-response) inbound nodes to registered handlers.
#[derive(Clone, Default)]
pub struct RequestRouter {
    pending: Arc<DashMap<String, PendingSlot>>,
    handlers: Arc<RwLock<Vec<Registration>>>,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `node` (with `id` already assigned to its `id` attribute) via `send`, then
    /// awaits the matching response for up to `timeout`. The slot is single-use: whichever
    /// of (response arrives, timeout fires, router fails all) reaches it first wins.
    pub async fn send_iq<S, Fut>(
        &self,
        mut node: BinaryNode,
        send: S,
        timeout: Duration,
    ) -> Result<BinaryNode, RouterError>
    where
        S: FnOnce(BinaryNode) -> Fut,
        Fut: std::future::Future<Output = Result<(), RouterError>>,
    {
        let id = generate_request_id();
        node = node.with_attr("id", &id);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        if let Err(err) = send(node).await {
            self.pending.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(RouterError::Timeout)
            }
        }
    }

    /// Delivers an inbound response node to its waiting slot, if any. Returns `false` when
    /// no request with this id is outstanding (a late timeout, or an unsolicited node).
    pub fn resolve(&self, id: &str, result: Result<BinaryNode, RouterError>) -> bool {
        if let Some((_, tx)) = self.pending.remove(id) {
            let _ = tx.send(result);
            true
        } else {
            false
        }
    }

    /// Fails every outstanding request, used when the transport disconnects.
    pub fn fail_all(&self) {
        for (_, tx) in self.pending.clone().into_iter() {
            let _ = tx.send(Err(RouterError::Disconnected));
        }
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Registers a handler for unsolicited inbound nodes — server pushes (receipts,
    /// presence, notifications) that aren't a reply to anything we sent, so `resolve` never
    /// sees them. `predicate` decides membership; the first matching registration wins.
    pub async fn register_handler<P, H, Fut>(&self, predicate: P, handler: H)
    where
        P: Fn(&BinaryNode) -> bool + Send + Sync + 'static,
        H: Fn(BinaryNode) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let registration = Registration {
            predicate: Arc::new(predicate),
            handler: Arc::new(move |node| Box::pin(handler(node))),
        };
        self.handlers.write().await.push(registration);
    }

    /// Routes an inbound node that didn't resolve a pending `<iq>` to the first matching
    /// registered handler. Returns `false` when nothing matched.
    pub async fn dispatch_unsolicited(&self, node: BinaryNode) -> bool {
        let handlers = self.handlers.read().await.clone();
        for registration in handlers {
            if (registration.predicate)(&node) {
                (registration.handler)(node).await;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_have_the_expected_shape() {
        for _ in 0..64 {
            let id = generate_request_id();
            assert_eq!(id.len(), 8);
            assert!(id.chars().all(|c| BASE32_ALPHABET.contains(&(c as u8))));
        }
    }

    #[tokio::test]
    async fn send_iq_resolves_on_matching_response() {
        let router = RequestRouter::new();
        let router_for_server = router.clone();

        let send = |node: BinaryNode| {
            let router = router_for_server.clone();
            async move {
                let id = node.attr("id").unwrap().to_owned();
                let response = BinaryNode::new("iq").with_attr("type", "result");
                router.resolve(&id, Ok(response));
                Ok(())
            }
        };

        let result = router
            .send_iq(BinaryNode::new("iq"), send, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.attr("type"), Some("result"));
    }

    #[tokio::test]
    async fn send_iq_times_out_without_a_response() {
        let router = RequestRouter::new();
        let send = |_node: BinaryNode| async { Ok(()) };
        let result = router
            .send_iq(BinaryNode::new("iq"), send, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(RouterError::Timeout)));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_rejects_every_outstanding_request() {
        let router = RequestRouter::new();
        let router_clone = router.clone();
        let handle = tokio::spawn(async move {
            let send = |_node: BinaryNode| async { Ok(()) };
            router_clone
                .send_iq(BinaryNode::new("iq"), send, Duration::from_secs(5))
                .await
        });

        // Give the spawned task a chance to register its pending slot.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        router.fail_all();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RouterError::Disconnected)));
    }

    #[tokio::test]
    async fn dispatch_unsolicited_routes_to_the_first_matching_handler() {
        let router = RequestRouter::new();
        let seen = Arc::new(DashMap::new());

        let seen_for_receipts = seen.clone();
        router
            .register_handler(
                |node: &BinaryNode| node.tag == "receipt",
                move |node: BinaryNode| {
                    let seen = seen_for_receipts.clone();
                    async move {
                        seen.insert("receipt", node.attr("id").unwrap().to_owned());
                    }
                },
            )
            .await;

        let matched = router
            .dispatch_unsolicited(BinaryNode::new("receipt").with_attr("id", "r1"))
            .await;
        assert!(matched);
        assert_eq!(seen.get("receipt").unwrap().value(), "r1");

        let unmatched = router.dispatch_unsolicited(BinaryNode::new("presence")).await;
        assert!(!unmatched);
    }
}
