//! Store capability traits for Signal protocol state, exposed as object-safe traits
//! returning boxed futures — the same idiom as the teacher's `db::auth_store::AuthStore`
//! (`BoxFuture` instead of `async_trait`) so a runtime can share `Arc<dyn Trait>` across
//! the reader/writer tasks and the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::error::StoreError;
use crate::identity::PreKeyRecord;
use crate::signal::group::SenderKeySession;
use crate::signal::ratchet::RatchetSession;

/// Per-address cached identity public key, for trust-on-first-use / pinning.
pub trait IdentityStore: Send + Sync {
    fn get_identity<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Option<[u8; 32]>, StoreError>>;
    fn save_identity<'a>(&'a self, address: &'a str, key: [u8; 32]) -> BoxFuture<'a, Result<(), StoreError>>;
}

pub trait SessionStore: Send + Sync {
    fn load_session<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Option<RatchetSession>, StoreError>>;
    fn save_session<'a>(&'a self, address: &'a str, session: RatchetSession) -> BoxFuture<'a, Result<(), StoreError>>;
    fn delete_session<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

pub trait SenderKeyStore: Send + Sync {
    fn load_sender_key<'a>(
        &'a self,
        group_address: &'a str,
    ) -> BoxFuture<'a, Result<Option<SenderKeySession>, StoreError>>;
    fn save_sender_key<'a>(
        &'a self,
        group_address: &'a str,
        session: SenderKeySession,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// One-time pre-key pool consumed during X3DH session establishment. Split out from
/// `IdentityStore`/`SessionStore` because it is mutated far more often than either — one
/// fetch-and-consume per inbound first-contact — and must stay safe under concurrent
/// access from multiple pipeline tasks racing to consume the same id.
pub trait PreKeyStore: Send + Sync {
    fn get<'a>(&'a self, id: u32) -> BoxFuture<'a, Result<Option<PreKeyRecord>, StoreError>>;
    /// Atomically removes and returns the record for `id`, so two concurrent lookups can't
    /// both consume the same one-time key.
    fn take<'a>(&'a self, id: u32) -> BoxFuture<'a, Result<Option<PreKeyRecord>, StoreError>>;
    fn count_unused(&self) -> BoxFuture<'_, Result<usize, StoreError>>;
    fn insert_many(&self, records: Vec<PreKeyRecord>) -> BoxFuture<'_, Result<(), StoreError>>;
    /// Drops every stored record whose id is below `keep_from_id`, used when a signed
    /// pre-key rotation invalidates the older half of the pool.
    fn rotate(&self, keep_from_id: u32) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Composed store capability used by the signal session manager.
pub trait SignalStore: IdentityStore + SessionStore + SenderKeyStore + PreKeyStore {}
impl<T> SignalStore for T where T: IdentityStore + SessionStore + SenderKeyStore + PreKeyStore {}

/// Standalone in-memory `PreKeyStore`, `Arc<DashMap<..>>`-backed like every other store in
/// this module.
#[derive(Clone, Default)]
pub struct InMemoryPreKeyStore {
    records: Arc<DashMap<u32, PreKeyRecord>>,
}

impl InMemoryPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the pool, e.g. from a freshly generated or persisted `DeviceIdentity`.
    pub fn seed(&self, records: impl IntoIterator<Item = PreKeyRecord>) {
        for record in records {
            self.records.insert(record.id, record);
        }
    }
}

impl PreKeyStore for InMemoryPreKeyStore {
    fn get<'a>(&'a self, id: u32) -> BoxFuture<'a, Result<Option<PreKeyRecord>, StoreError>> {
        Box::pin(async move { Ok(self.records.get(&id).map(|v| v.clone())) })
    }

    fn take<'a>(&'a self, id: u32) -> BoxFuture<'a, Result<Option<PreKeyRecord>, StoreError>> {
        Box::pin(async move { Ok(self.records.remove(&id).map(|(_, v)| v)) })
    }

    fn count_unused(&self) -> BoxFuture<'_, Result<usize, StoreError>> {
        Box::pin(async move { Ok(self.records.len()) })
    }

    fn insert_many(&self, records: Vec<PreKeyRecord>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            for record in records {
                self.records.insert(record.id, record);
            }
            Ok(())
        })
    }

    fn rotate(&self, keep_from_id: u32) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.records.retain(|id, _| *id >= keep_from_id);
            Ok(())
        })
    }
}

/// In-memory implementation used by tests and single-process deployments, matching the
/// teacher's `InMemorySignalStore` / `InMemoryAuthStore` shape.
#[derive(Clone, Default)]
pub struct InMemorySignalStore {
    identities: Arc<DashMap<String, [u8; 32]>>,
    sessions: Arc<DashMap<String, RatchetSession>>,
    sender_keys: Arc<DashMap<String, SenderKeySession>>,
    pre_keys: InMemoryPreKeyStore,
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all stored sessions, useful for persistence-layer integration tests.
    pub fn session_snapshot(&self) -> HashMap<String, RatchetSession> {
        self.sessions.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Seeds the one-time pre-key pool backing this store's `PreKeyStore` impl.
    pub fn seed_pre_keys(&self, records: impl IntoIterator<Item = PreKeyRecord>) {
        self.pre_keys.seed(records);
    }
}

impl IdentityStore for InMemorySignalStore {
    fn get_identity<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Option<[u8; 32]>, StoreError>> {
        Box::pin(async move { Ok(self.identities.get(address).map(|v| *v)) })
    }

    fn save_identity<'a>(&'a self, address: &'a str, key: [u8; 32]) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.identities.insert(address.to_owned(), key);
            Ok(())
        })
    }
}

impl SessionStore for InMemorySignalStore {
    fn load_session<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Option<RatchetSession>, StoreError>> {
        Box::pin(async move { Ok(self.sessions.get(address).map(|v| v.clone())) })
    }

    fn save_session<'a>(&'a self, address: &'a str, session: RatchetSession) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.sessions.insert(address.to_owned(), session);
            Ok(())
        })
    }

    fn delete_session<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.sessions.remove(address);
            Ok(())
        })
    }
}

impl SenderKeyStore for InMemorySignalStore {
    fn load_sender_key<'a>(
        &'a self,
        group_address: &'a str,
    ) -> BoxFuture<'a, Result<Option<SenderKeySession>, StoreError>> {
        Box::pin(async move { Ok(self.sender_keys.get(group_address).map(|v| v.clone())) })
    }

    fn save_sender_key<'a>(
        &'a self,
        group_address: &'a str,
        session: SenderKeySession,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.sender_keys.insert(group_address.to_owned(), session);
            Ok(())
        })
    }
}

impl PreKeyStore for InMemorySignalStore {
    fn get<'a>(&'a self, id: u32) -> BoxFuture<'a, Result<Option<PreKeyRecord>, StoreError>> {
        self.pre_keys.get(id)
    }

    fn take<'a>(&'a self, id: u32) -> BoxFuture<'a, Result<Option<PreKeyRecord>, StoreError>> {
        self.pre_keys.take(id)
    }

    fn count_unused(&self) -> BoxFuture<'_, Result<usize, StoreError>> {
        self.pre_keys.count_unused()
    }

    fn insert_many(&self, records: Vec<PreKeyRecord>) -> BoxFuture<'_, Result<(), StoreError>> {
        self.pre_keys.insert_many(records)
    }

    fn rotate(&self, keep_from_id: u32) -> BoxFuture<'_, Result<(), StoreError>> {
        self.pre_keys.rotate(keep_from_id)
    }
}

#[cfg(test)]
mod prekey_store_tests {
    use super::*;

    #[tokio::test]
    async fn take_consumes_exactly_once() {
        let store = InMemoryPreKeyStore::new();
        store.seed([PreKeyRecord {
            id: 3,
            key_pair: crate::keys::generate_keypair(),
        }]);

        assert!(store.take(3).await.unwrap().is_some());
        assert!(store.take(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotate_drops_ids_below_the_new_floor() {
        let store = InMemoryPreKeyStore::new();
        store.seed((0..5).map(|id| PreKeyRecord {
            id,
            key_pair: crate::keys::generate_keypair(),
        }));

        store.rotate(3).await.unwrap();
        assert_eq!(store.count_unused().await.unwrap(), 2);
        assert!(store.get(1).await.unwrap().is_none());
        assert!(store.get(3).await.unwrap().is_some());
    }
}
