//! Non-cryptographic persistence contracts: device identity, app-state sync keys,
//! contacts, and chat settings. Grounded on `db::auth_store::AuthStore`'s `BoxFuture`
//! idiom — these traits are the same shape but widened to cover the whole device state
//! this crate owns, not just one auth blob. App-state/contact/chat-settings bodies stay
//! opaque `Bytes` blobs per the specification's non-goals; callers that need to interpret
//! them own that logic.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::identity::DeviceIdentity;

/// Persists the single local device identity (keys, pre-keys, paired-account metadata).
pub trait IdentityStore: Send + Sync {
    fn load_identity(&self) -> BoxFuture<'_, Result<Option<DeviceIdentity>, StoreError>>;
    fn save_identity<'a>(&'a self, identity: &'a DeviceIdentity) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Opaque app-state sync key/value storage (contacts, chat mutes, archive state, etc.),
/// keyed by the server's own key names — interpretation is explicitly out of scope here.
pub trait AppStateStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>>;
    fn set<'a>(&'a self, key: &'a str, value: Bytes) -> BoxFuture<'a, Result<(), StoreError>>;
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Cached contact metadata (push name, business name) keyed by JID string.
pub trait ContactStore: Send + Sync {
    fn get_contact<'a>(&'a self, jid: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>>;
    fn put_contact<'a>(&'a self, jid: &'a str, value: Bytes) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Per-chat opaque settings blob (mute state, ephemeral timer, pin), keyed by JID string.
pub trait ChatSettingsStore: Send + Sync {
    fn get_settings<'a>(&'a self, jid: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>>;
    fn put_settings<'a>(&'a self, jid: &'a str, value: Bytes) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Composed store capability used by the connection supervisor and pipeline.
pub trait DeviceStore: IdentityStore + AppStateStore + ContactStore + ChatSettingsStore {}
impl<T> DeviceStore for T where T: IdentityStore + AppStateStore + ContactStore + ChatSettingsStore {}

/// In-memory implementation for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryDeviceStore {
    identity: Arc<RwLock<Option<DeviceIdentity>>>,
    app_state: Arc<RwLock<HashMap<String, Bytes>>>,
    contacts: Arc<RwLock<HashMap<String, Bytes>>>,
    chat_settings: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for InMemoryDeviceStore {
    fn load_identity(&self) -> BoxFuture<'_, Result<Option<DeviceIdentity>, StoreError>> {
        Box::pin(async move { Ok(self.identity.read().await.clone()) })
    }

    fn save_identity<'a>(&'a self, identity: &'a DeviceIdentity) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            *self.identity.write().await = Some(identity.clone());
            Ok(())
        })
    }
}

impl AppStateStore for InMemoryDeviceStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        Box::pin(async move { Ok(self.app_state.read().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.app_state.write().await.insert(key.to_owned(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.app_state.write().await.remove(key);
            Ok(())
        })
    }
}

impl ContactStore for InMemoryDeviceStore {
    fn get_contact<'a>(&'a self, jid: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        Box::pin(async move { Ok(self.contacts.read().await.get(jid).cloned()) })
    }

    fn put_contact<'a>(&'a self, jid: &'a str, value: Bytes) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.contacts.write().await.insert(jid.to_owned(), value);
            Ok(())
        })
    }
}

impl ChatSettingsStore for InMemoryDeviceStore {
    fn get_settings<'a>(&'a self, jid: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        Box::pin(async move { Ok(self.chat_settings.read().await.get(jid).cloned()) })
    }

    fn put_settings<'a>(&'a self, jid: &'a str, value: Bytes) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.chat_settings.write().await.insert(jid.to_owned(), value);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;

    #[tokio::test]
    async fn identity_round_trips() {
        let store = InMemoryDeviceStore::new();
        assert!(store.load_identity().await.unwrap().is_none());

        let identity = DeviceIdentity::generate(1);
        store.save_identity(&identity).await.unwrap();
        let loaded = store.load_identity().await.unwrap().unwrap();
        assert_eq!(loaded.registration_id, identity.registration_id);
    }

    #[tokio::test]
    async fn app_state_set_get_delete() {
        let store = InMemoryDeviceStore::new();
        store.set("critical_unblock_low", Bytes::from_static(b"v1")).await.unwrap();
        assert_eq!(store.get("critical_unblock_low").await.unwrap().unwrap(), Bytes::from_static(b"v1"));
        store.delete("critical_unblock_low").await.unwrap();
        assert!(store.get("critical_unblock_low").await.unwrap().is_none());
    }
}
