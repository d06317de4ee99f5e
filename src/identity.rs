//! Device identity: the persistent cryptographic material and account metadata a
//! companion device carries across reconnections. Grounded on the teacher's
//! `src/wa/auth.rs::AuthState`, but the signed pre-key now carries a real signature
//! (the teacher generated random bytes as a placeholder) and the registration id is
//! 31 bits wide (see DESIGN.md).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::jid::Jid;
use crate::keys::{generate_keypair, generate_registration_id, sign_message, verify_message, KeyPair};

/// Information about the currently-paired account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccountInfo {
    pub jid: Option<Jid>,
    pub lid: Option<Jid>,
    pub push_name: Option<String>,
    pub business_name: Option<String>,
    pub platform: Option<String>,
    /// Primary device's signature over this device's identity key, proving this device
    /// was legitimately linked.
    pub account_signature: Option<[u8; 64]>,
    pub account_signature_key: Option<[u8; 32]>,
}

/// A signed pre-key: a medium-term X25519 keypair, signed by the Signal identity key so
/// that remote parties can authenticate it without a one-time prekey being present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: KeyPair,
    pub signature: [u8; 64],
}

impl SignedPreKey {
    pub fn generate(id: u32, identity: &KeyPair) -> Self {
        let key_pair = generate_keypair();
        let signature = sign_message(identity.private, identity.public, &key_pair.public);
        Self { id, key_pair, signature }
    }

    pub fn verify(&self, identity_public: [u8; 32]) -> bool {
        verify_message(identity_public, &self.key_pair.public, &self.signature)
    }
}

/// One-time pre-key: consumed exactly once during session initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub id: u32,
    pub key_pair: KeyPair,
}

/// Identity and pre-key material persisted per device installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Static Noise transport keypair — distinct from the Signal identity keypair.
    pub noise_key: KeyPair,
    /// Long-lived Signal identity keypair.
    pub identity_key: KeyPair,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKey,
    pub one_time_pre_keys: HashMap<u32, PreKeyRecord>,
    pub next_pre_key_id: u32,
    /// The advertised identity signature WhatsApp calls "adv_secret"; authenticates the
    /// signed device identity to contacts.
    pub adv_secret: [u8; 32],
    pub account: AccountInfo,
}

impl DeviceIdentity {
    /// Creates a fresh device identity with `initial_pre_keys` one-time pre-keys.
    pub fn generate(initial_pre_keys: u32) -> Self {
        let identity_key = generate_keypair();
        let signed_pre_key = SignedPreKey::generate(1, &identity_key);

        let one_time_pre_keys = (1..=initial_pre_keys)
            .map(|id| (id, PreKeyRecord { id, key_pair: generate_keypair() }))
            .collect();

        let mut adv_secret = [0_u8; 32];
        rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut adv_secret);

        Self {
            noise_key: generate_keypair(),
            identity_key,
            registration_id: generate_registration_id(),
            signed_pre_key,
            one_time_pre_keys,
            next_pre_key_id: initial_pre_keys + 1,
            adv_secret,
            account: AccountInfo::default(),
        }
    }

    /// Number of one-time pre-keys still available for consumption.
    pub fn available_pre_key_count(&self) -> usize {
        self.one_time_pre_keys.len()
    }

    /// True when the unused pool has dropped below the configured low-water mark.
    pub fn needs_refill(&self, low_water: usize) -> bool {
        self.available_pre_key_count() < low_water
    }

    /// Generates fresh pre-keys up to `target` total unused keys.
    pub fn refill_pre_keys(&mut self, target: usize) {
        while self.available_pre_key_count() < target {
            let id = self.next_pre_key_id;
            self.next_pre_key_id += 1;
            self.one_time_pre_keys
                .insert(id, PreKeyRecord { id, key_pair: generate_keypair() });
        }
    }

    /// Consumes (removes) a one-time pre-key by id, returning it if present and unused.
    pub fn take_pre_key(&mut self, id: u32) -> Option<PreKeyRecord> {
        self.one_time_pre_keys.remove(&id)
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::generate(16)
    }
}
