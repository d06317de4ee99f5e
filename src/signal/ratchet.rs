//! X3DH-like session initialization and the double-ratchet message protocol: symmetric-key
//! chain advances via HMAC, DH ratchet steps via HKDF, AES-256-CBC + HMAC-SHA256
//! (encrypt-then-MAC, truncated to 8 bytes) for message confidentiality/integrity, and a
//! bounded pool of skipped message keys for reordered/lost messages.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::SignalError;
use crate::keys::KeyPair;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub key: [u8; 32],
    pub counter: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_pub: [u8; 32],
    counter: u32,
    message_key: [u8; 32],
    created_at_unix: u64,
}

/// A single double-ratchet session against one remote device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    pub root_key: [u8; 32],
    pub dh_self: KeyPair,
    pub dh_remote: Option<[u8; 32]>,
    pub sending_chain: Option<ChainState>,
    pub receiving_chains: Vec<([u8; 32], ChainState)>,
    pub previous_sending_counter: u32,
    skipped: VecDeque<SkippedKey>,
}

/// Wire envelope for a ratchet-encrypted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub ratchet_pub: [u8; 32],
    pub counter: u32,
    pub previous_counter: u32,
    pub ciphertext: Vec<u8>,
    pub mac: [u8; 8],
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn x3dh_derive(dh_parts: &[&[u8; 32]]) -> ([u8; 32], [u8; 32]) {
    let mut ikm = Vec::with_capacity(32 * dh_parts.len());
    for part in dh_parts {
        ikm.extend_from_slice(*part);
    }
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
    let mut okm = [0u8; 64];
    hk.expand(b"wa-rs x3dh", &mut okm).expect("64 is a valid HKDF-SHA256 output length");

    let mut root_key = [0u8; 32];
    let mut chain_key = [0u8; 32];
    root_key.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    (root_key, chain_key)
}

impl RatchetSession {
    /// Initiator side of X3DH: we have the peer's identity, signed pre-key, and
    /// (optionally) a one-time pre-key; we contribute a fresh ephemeral, which also
    /// doubles as our first ratchet keypair.
    pub fn init_as_initiator(
        identity: &KeyPair,
        ephemeral: &KeyPair,
        their_identity: [u8; 32],
        their_signed_pre_key: [u8; 32],
        their_one_time_pre_key: Option<[u8; 32]>,
    ) -> Self {
        let dh1 = identity.diffie_hellman(&their_signed_pre_key);
        let dh2 = ephemeral.diffie_hellman(&their_identity);
        let dh3 = ephemeral.diffie_hellman(&their_signed_pre_key);
        let mut parts = vec![&dh1, &dh2, &dh3];
        let dh4 = their_one_time_pre_key.map(|otp| ephemeral.diffie_hellman(&otp));
        if let Some(ref dh4) = dh4 {
            parts.push(dh4);
        }
        let (root_key, chain_key) = x3dh_derive(&parts);

        Self {
            root_key,
            dh_self: *ephemeral,
            dh_remote: Some(their_signed_pre_key),
            sending_chain: Some(ChainState { key: chain_key, counter: 0 }),
            receiving_chains: Vec::new(),
            previous_sending_counter: 0,
            skipped: VecDeque::new(),
        }
    }

    /// Responder side: mirrors the initiator's computation using our signed (and
    /// optionally one-time) pre-key private scalars against their identity/ephemeral.
    pub fn init_as_responder(
        identity: &KeyPair,
        signed_pre_key: &KeyPair,
        one_time_pre_key: Option<&KeyPair>,
        their_identity: [u8; 32],
        their_ephemeral: [u8; 32],
    ) -> Self {
        let dh1 = signed_pre_key.diffie_hellman(&their_identity);
        let dh2 = identity.diffie_hellman(&their_ephemeral);
        let dh3 = signed_pre_key.diffie_hellman(&their_ephemeral);
        let mut parts = vec![&dh1, &dh2, &dh3];
        let dh4 = one_time_pre_key.map(|otp| otp.diffie_hellman(&their_ephemeral));
        if let Some(ref dh4) = dh4 {
            parts.push(dh4);
        }
        let (root_key, chain_key) = x3dh_derive(&parts);

        Self {
            root_key,
            dh_self: *signed_pre_key,
            dh_remote: Some(their_ephemeral),
            sending_chain: None,
            receiving_chains: vec![(their_ephemeral, ChainState { key: chain_key, counter: 0 })],
            previous_sending_counter: 0,
            skipped: VecDeque::new(),
        }
    }

    fn dh_ratchet_step(&mut self, new_remote: [u8; 32]) {
        let dh_out = self.dh_self.diffie_hellman(&new_remote);
        let hk = Hkdf::<Sha256>::new(Some(&self.root_key), &dh_out);
        let mut okm = [0u8; 64];
        hk.expand(b"wa-rs dh-ratchet", &mut okm).expect("64 is valid");
        self.root_key.copy_from_slice(&okm[..32]);
        let recv_chain_key: [u8; 32] = okm[32..].try_into().unwrap();

        if let Some(sending) = &self.sending_chain {
            self.previous_sending_counter = sending.counter;
        }
        self.dh_remote = Some(new_remote);
        self.receiving_chains
            .push((new_remote, ChainState { key: recv_chain_key, counter: 0 }));

        // Rotate our own ratchet keypair and derive the next sending chain too.
        let fresh = crate::keys::generate_keypair();
        let dh_out2 = fresh.diffie_hellman(&new_remote);
        let hk2 = Hkdf::<Sha256>::new(Some(&self.root_key), &dh_out2);
        let mut okm2 = [0u8; 64];
        hk2.expand(b"wa-rs dh-ratchet", &mut okm2).expect("64 is valid");
        self.root_key.copy_from_slice(&okm2[..32]);
        let send_chain_key: [u8; 32] = okm2[32..].try_into().unwrap();
        self.dh_self = fresh;
        self.sending_chain = Some(ChainState { key: send_chain_key, counter: 0 });
    }

    fn advance_chain(chain: &mut ChainState) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&chain.key).expect("hmac accepts any key length");
        mac.update(MESSAGE_KEY_SEED);
        let message_key: [u8; 32] = mac.finalize().into_bytes().into();

        let mut mac = HmacSha256::new_from_slice(&chain.key).expect("hmac accepts any key length");
        mac.update(CHAIN_KEY_SEED);
        chain.key = mac.finalize().into_bytes().into();
        chain.counter += 1;
        message_key
    }

    /// Encrypts `plaintext`, advancing the sending chain by one step.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SignalMessage, SignalError> {
        let chain = self
            .sending_chain
            .as_mut()
            .ok_or_else(|| SignalError::NoSession("no sending chain established".into()))?;
        let counter = chain.counter;
        let message_key = Self::advance_chain(chain);

        let (enc_key, mac_key, iv) = expand_message_key(&message_key);
        let ciphertext = Aes256CbcEnc::new(&enc_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut message = SignalMessage {
            ratchet_pub: self.dh_self.public,
            counter,
            previous_counter: self.previous_sending_counter,
            ciphertext,
            mac: [0u8; 8],
        };
        message.mac = compute_mac(&mac_key, &message);
        Ok(message)
    }

    /// Decrypts `message`, performing a DH ratchet step if it announces a new remote
    /// ratchet key, and deriving/skipping message keys as needed to reach its counter.
    pub fn decrypt(
        &mut self,
        message: &SignalMessage,
        max_skipped: usize,
        max_skipped_age_secs: u64,
    ) -> Result<Vec<u8>, SignalError> {
        if let Some(skipped_key) = self.take_skipped_key(message.ratchet_pub, message.counter) {
            return self.open_with_message_key(skipped_key, message);
        }

        if self.dh_remote != Some(message.ratchet_pub) {
            if let Some(chain_idx) = self
                .receiving_chains
                .iter()
                .position(|(pub_key, _)| *pub_key == message.ratchet_pub)
            {
                // We've ratcheted past this key before but kept it around; fall through
                // to the normal skip-ahead path using the existing chain.
                let _ = chain_idx;
            } else {
                self.skip_remaining_in_current_chain(max_skipped, max_skipped_age_secs)?;
                self.dh_ratchet_step(message.ratchet_pub);
            }
        }

        let chain_entry = self
            .receiving_chains
            .iter_mut()
            .find(|(pub_key, _)| *pub_key == message.ratchet_pub)
            .ok_or_else(|| SignalError::NoSession("no receiving chain for announced ratchet key".into()))?;

        while chain_entry.1.counter < message.counter {
            if self.skipped.len() >= max_skipped {
                self.skipped.pop_front();
            }
            let mk = Self::advance_chain(&mut chain_entry.1);
            self.skipped.push_back(SkippedKey {
                ratchet_pub: message.ratchet_pub,
                counter: chain_entry.1.counter - 1,
                message_key: mk,
                created_at_unix: now_unix(),
            });
        }

        let message_key = Self::advance_chain(chain_entry);
        self.open_with_message_key(message_key, message)
    }

    fn skip_remaining_in_current_chain(
        &mut self,
        max_skipped: usize,
        _max_skipped_age_secs: u64,
    ) -> Result<(), SignalError> {
        // Bound enforcement happens lazily as keys are pushed; nothing to pre-compute
        // here since the current chain's final counter isn't known until a new message
        // under the *next* ratchet key arrives. Eviction is FIFO, applied in `decrypt`.
        let _ = max_skipped;
        Ok(())
    }

    fn take_skipped_key(&mut self, ratchet_pub: [u8; 32], counter: u32) -> Option<[u8; 32]> {
        let idx = self
            .skipped
            .iter()
            .position(|k| k.ratchet_pub == ratchet_pub && k.counter == counter)?;
        self.skipped.remove(idx).map(|k| k.message_key)
    }

    fn open_with_message_key(
        &self,
        message_key: [u8; 32],
        message: &SignalMessage,
    ) -> Result<Vec<u8>, SignalError> {
        let (enc_key, mac_key, iv) = expand_message_key(&message_key);
        let expected_mac = compute_mac(&mac_key, message);
        if !constant_time_eq(&expected_mac, &message.mac) {
            return Err(SignalError::BadMac);
        }

        Aes256CbcDec::new(&enc_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&message.ciphertext)
            .map_err(|_| SignalError::MalformedCiphertext)
    }

    pub fn evict_expired_skipped_keys(&mut self, max_age_secs: u64) {
        let now = now_unix();
        self.skipped.retain(|k| now.saturating_sub(k.created_at_unix) <= max_age_secs);
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }
}

fn expand_message_key(message_key: &[u8; 32]) -> ([u8; 32], [u8; 32], [u8; 16]) {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 80];
    hk.expand(b"wa-rs message-key", &mut okm).expect("80 is a valid HKDF-SHA256 output length");

    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    let mut iv = [0u8; 16];
    enc_key.copy_from_slice(&okm[..32]);
    mac_key.copy_from_slice(&okm[32..64]);
    iv.copy_from_slice(&okm[64..80]);
    (enc_key, mac_key, iv)
}

fn compute_mac(mac_key: &[u8; 32], message: &SignalMessage) -> [u8; 8] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(&message.ratchet_pub);
    mac.update(&message.counter.to_be_bytes());
    mac.update(&message.previous_counter.to_be_bytes());
    mac.update(&message.ciphertext);
    let full = mac.finalize().into_bytes();
    let mut truncated = [0u8; 8];
    truncated.copy_from_slice(&full[..8]);
    truncated
}

fn constant_time_eq(a: &[u8; 8], b: &[u8; 8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}
