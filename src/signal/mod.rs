//! Signal protocol engine: X3DH session setup, the double ratchet for one-to-one
//! messages, sender-key chains for group fanout, and the identity trust policy that
//! gates all of it. This module is the session-manager layer; `ratchet`/`group` hold the
//! cryptographic state machines and `store` holds the persistence traits.

pub mod group;
pub mod ratchet;
pub mod store;

use std::sync::Arc;

use crate::config::SignalConfig;
use crate::error::SignalError;
use crate::identity::DeviceIdentity;
use group::{SenderKeyMessage, SenderKeySession};
use ratchet::{RatchetSession, SignalMessage};
use store::SignalStore;

/// Everything needed to initiate a session against a remote device: its identity key,
/// signed pre-key (with signature), and optionally a one-time pre-key — the shape the
/// server hands back from a pre-key fetch ("key bundle").
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub one_time_pre_key_id: Option<u32>,
    pub one_time_pre_key: Option<[u8; 32]>,
}

/// Session-manager facade: owns no state of its own beyond a reference to the store and
/// the local device identity, dispatching to `RatchetSession`/`SenderKeySession` as
/// sessions are loaded and saved around each operation.
pub struct SignalEngine<S: SignalStore> {
    store: Arc<S>,
    config: SignalConfig,
}

impl<S: SignalStore> SignalEngine<S> {
    pub fn new(store: Arc<S>, config: SignalConfig) -> Self {
        Self { store, config }
    }

    /// Verifies `bundle`'s signed pre-key against its claimed identity key, then applies
    /// the identity trust policy for `address`.
    pub async fn verify_and_pin_identity(
        &self,
        address: &str,
        bundle: &PreKeyBundle,
    ) -> Result<(), SignalError> {
        if !crate::keys::verify_message(
            bundle.identity_key,
            &bundle.signed_pre_key,
            &bundle.signed_pre_key_signature,
        ) {
            return Err(SignalError::BadSignedPreKeySignature);
        }

        self.check_and_pin_identity(address, bundle.identity_key).await
    }

    /// Applies the identity trust policy (first-contact pin, reject-on-change unless
    /// `auto_trust_identity_change`) against any previously pinned identity for `address`.
    /// Shared by `verify_and_pin_identity` (outbound, where a signed bundle is available to
    /// authenticate the key first) and `init_inbound_session` (inbound, where the identity
    /// arrives embedded in the initial message itself with nothing further to verify it
    /// against) so both paths enforce the same policy.
    async fn check_and_pin_identity(&self, address: &str, identity_key: [u8; 32]) -> Result<(), SignalError> {
        match self.store.get_identity(address).await? {
            None => {
                self.store.save_identity(address, identity_key).await?;
                Ok(())
            }
            Some(pinned) if pinned == identity_key => Ok(()),
            Some(_) if self.config.auto_trust_identity_change => {
                self.store.save_identity(address, identity_key).await?;
                Ok(())
            }
            Some(_) => Err(SignalError::UntrustedIdentity(address.to_owned())),
        }
    }

    /// Establishes a new one-to-one session as the initiator (X3DH) and persists it,
    /// consuming the bundle's one-time pre-key id as a caller-visible side effect (the
    /// caller is responsible for marking that id used against its own bundle cache).
    pub async fn init_outbound_session(
        &self,
        address: &str,
        identity: &DeviceIdentity,
        bundle: &PreKeyBundle,
    ) -> Result<(), SignalError> {
        self.verify_and_pin_identity(address, bundle).await?;

        let ephemeral = crate::keys::generate_keypair();
        let session = RatchetSession::init_as_initiator(
            &identity.identity_key,
            &ephemeral,
            bundle.identity_key,
            bundle.signed_pre_key,
            bundle.one_time_pre_key,
        );
        self.store.save_session(address, session).await?;
        Ok(())
    }

    /// Establishes a new one-to-one session as the responder, from an inbound initial
    /// message's embedded identity/ephemeral keys. `one_time_pre_key_id` is consumed from
    /// our own pre-key store (if present) rather than taken on faith from the caller, so a
    /// key can't be reused across two racing inbound session inits. Gated by the same
    /// identity trust policy as the outbound path: an identity change for an address we've
    /// already pinned is rejected unless `auto_trust_identity_change` is set, and on
    /// rejection no session is written.
    pub async fn init_inbound_session(
        &self,
        address: &str,
        identity: &DeviceIdentity,
        one_time_pre_key_id: Option<u32>,
        their_identity: [u8; 32],
        their_ephemeral: [u8; 32],
    ) -> Result<(), SignalError> {
        self.check_and_pin_identity(address, their_identity).await?;

        let one_time_pre_key = match one_time_pre_key_id {
            Some(id) => self.store.take(id).await?.map(|record| record.key_pair),
            None => None,
        };

        let session = RatchetSession::init_as_responder(
            &identity.identity_key,
            &identity.signed_pre_key.key_pair,
            one_time_pre_key.as_ref(),
            their_identity,
            their_ephemeral,
        );
        self.store.save_session(address, session).await?;
        Ok(())
    }

    pub async fn encrypt(&self, address: &str, plaintext: &[u8]) -> Result<SignalMessage, SignalError> {
        let mut session = self
            .store
            .load_session(address)
            .await?
            .ok_or_else(|| SignalError::NoSession(address.to_owned()))?;
        let message = session.encrypt(plaintext)?;
        self.store.save_session(address, session).await?;
        Ok(message)
    }

    pub async fn decrypt(&self, address: &str, message: &SignalMessage) -> Result<Vec<u8>, SignalError> {
        let mut session = self
            .store
            .load_session(address)
            .await?
            .ok_or_else(|| SignalError::NoSession(address.to_owned()))?;
        let plaintext = session.decrypt(
            message,
            self.config.max_skipped_keys,
            self.config.max_skipped_key_age_secs,
        )?;
        session.evict_expired_skipped_keys(self.config.max_skipped_key_age_secs);
        self.store.save_session(address, session).await?;
        Ok(plaintext)
    }

    /// Originates (or rotates) a sender-key chain for a group we're sending into.
    pub async fn init_sender_key(&self, group_address: &str, key_id: u32) -> Result<SenderKeySession, SignalError> {
        let session = SenderKeySession::generate(key_id);
        self.store.save_sender_key(group_address, session.clone()).await?;
        Ok(session)
    }

    /// Installs a sender-key chain distributed by another participant.
    pub async fn install_sender_key(
        &self,
        group_address: &str,
        id: u32,
        iteration: u32,
        chain_key: [u8; 32],
        signing_public: [u8; 32],
    ) -> Result<(), SignalError> {
        let session = SenderKeySession::from_distribution(id, iteration, chain_key, signing_public);
        self.store.save_sender_key(group_address, session).await?;
        Ok(())
    }

    pub async fn encrypt_group(
        &self,
        group_address: &str,
        plaintext: &[u8],
    ) -> Result<SenderKeyMessage, SignalError> {
        let mut session = self
            .store
            .load_sender_key(group_address)
            .await?
            .ok_or_else(|| SignalError::MissingSenderKey(group_address.to_owned()))?;
        let message = session.encrypt(plaintext)?;
        self.store.save_sender_key(group_address, session).await?;
        Ok(message)
    }

    pub async fn decrypt_group(
        &self,
        group_address: &str,
        message: &SenderKeyMessage,
    ) -> Result<Vec<u8>, SignalError> {
        let mut session = self
            .store
            .load_sender_key(group_address)
            .await?
            .ok_or_else(|| SignalError::MissingSenderKey(group_address.to_owned()))?;
        let plaintext = session.decrypt(message)?;
        self.store.save_sender_key(group_address, session).await?;
        Ok(plaintext)
    }
}
