//! Noise protocol primitives (symmetric state) shared by the handshake and the
//! post-handshake transport cipher states.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::error::NoiseError;

pub const WA_NOISE_PROLOGUE: &[u8] = b"WA\x06\x05";
pub const NOISE_PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_AESGCM_SHA256";

/// Symmetric state for a single Noise_XX handshake, mixing hash and key material as the
/// handshake messages are processed.
#[derive(Debug, Clone)]
pub struct NoiseState {
    h: [u8; 32],
    chaining_key: [u8; 32],
    session_key: [u8; 32],
}

impl NoiseState {
    pub fn new(prologue: &[u8]) -> Self {
        let h = initialize_handshake_hash(NOISE_PROTOCOL_NAME);
        let mut state = Self {
            h,
            chaining_key: h,
            session_key: [0_u8; 32],
        };
        state.mix_hash(prologue);
        state
    }

    pub fn new_wa() -> Self {
        Self::new(WA_NOISE_PROLOGUE)
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h.copy_from_slice(&hasher.finalize());
    }

    /// Mixes key material using HKDF-SHA256, updating chaining and session keys.
    pub fn mix_into_key(&mut self, ikm: &[u8]) {
        let hk = Hkdf::<Sha256>::new(Some(&self.chaining_key), ikm);
        let mut output = [0_u8; 64];
        if hk.expand(&[], &mut output).is_err() {
            return;
        }
        self.chaining_key.copy_from_slice(&output[..32]);
        self.session_key.copy_from_slice(&output[32..]);
    }

    /// One-shot AEAD encrypt using the current session key, associated data `self.h`, and
    /// an explicit nonce counter (used only during the handshake, where mix_hash is called
    /// after every message rather than tracked by a running cipher state).
    pub fn encrypt_with_ad(&mut self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        encrypt(&self.session_key, counter, plaintext, &self.h)
    }

    pub fn decrypt_with_ad(&mut self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        decrypt(&self.session_key, counter, ciphertext, &self.h)
    }

    pub fn handshake_hash(&self) -> [u8; 32] {
        self.h
    }

    pub fn chaining_key(&self) -> [u8; 32] {
        self.chaining_key
    }

    pub fn session_key(&self) -> [u8; 32] {
        self.session_key
    }
}

/// A single directional post-handshake AEAD cipher state: a fixed key and a strictly
/// increasing 64-bit nonce counter, forming the low 8 bytes of the 12-byte AES-GCM nonce
/// (high 4 bytes zero).
#[derive(Debug, Clone)]
pub struct CipherState {
    key: [u8; 32],
    counter: u64,
}

impl CipherState {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let out = encrypt(&self.key, self.counter, plaintext, &[])?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(NoiseError::CounterExhausted)?;
        Ok(out)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let out = decrypt(&self.key, self.counter, ciphertext, &[])?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(NoiseError::CounterExhausted)?;
        Ok(out)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Re-derives this cipher's key via HKDF over the current key and resets the nonce
    /// counter to zero. The connection owner calls this on both directional `CipherState`s
    /// together on demand, rotating both chain keys the way a long-lived session must
    /// periodically refresh its key material without a full re-handshake.
    pub fn rekey(&mut self) {
        let hk = Hkdf::<Sha256>::new(None, &self.key);
        let mut next_key = [0_u8; 32];
        hk.expand(b"wa-rs rekey", &mut next_key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        self.key = next_key;
        self.counter = 0;
    }
}

fn build_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0_u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn encrypt(key: &[u8; 32], counter: u64, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let nonce = build_nonce(counter);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| NoiseError::Cipher)?;
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: plaintext, aad: ad },
        )
        .map_err(|_| NoiseError::Cipher)
}

fn decrypt(key: &[u8; 32], counter: u64, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let nonce = build_nonce(counter);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| NoiseError::Cipher)?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: ciphertext, aad: ad },
        )
        .map_err(|_| NoiseError::Cipher)
}

fn initialize_handshake_hash(protocol_name: &[u8]) -> [u8; 32] {
    let mut hash = [0_u8; 32];
    if protocol_name.len() <= hash.len() {
        hash[..protocol_name.len()].copy_from_slice(protocol_name);
        return hash;
    }
    hash.copy_from_slice(&Sha256::digest(protocol_name));
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_places_counter_in_low_eight_bytes() {
        let nonce = build_nonce(1);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..], &1u64.to_be_bytes());
    }

    #[test]
    fn cipher_state_round_trips_and_advances_counter() {
        let mut tx = CipherState::new([7u8; 32]);
        let mut rx = CipherState::new([7u8; 32]);

        let ct1 = tx.encrypt(b"hello").unwrap();
        let pt1 = rx.decrypt(&ct1).unwrap();
        assert_eq!(pt1, b"hello");
        assert_eq!(tx.counter(), 1);
        assert_eq!(rx.counter(), 1);

        let ct2 = tx.encrypt(b"world").unwrap();
        let pt2 = rx.decrypt(&ct2).unwrap();
        assert_eq!(pt2, b"world");
    }

    #[test]
    fn decrypt_fails_on_tampered_ciphertext() {
        let mut tx = CipherState::new([9u8; 32]);
        let mut rx = CipherState::new([9u8; 32]);
        let mut ct = tx.encrypt(b"payload").unwrap();
        *ct.last_mut().unwrap() ^= 0xFF;
        assert!(rx.decrypt(&ct).is_err());
    }

    #[test]
    fn rekey_changes_the_key_resets_the_counter_and_preserves_round_tripping() {
        let mut tx = CipherState::new([3u8; 32]);
        let mut rx = CipherState::new([3u8; 32]);
        tx.encrypt(b"before rekey").unwrap();
        rx.decrypt(&tx.encrypt(b"again").unwrap()).unwrap();

        let key_before = tx.key;
        tx.rekey();
        rx.rekey();
        assert_ne!(tx.key, key_before);
        assert_eq!(tx.key, rx.key);
        assert_eq!(tx.counter(), 0);
        assert_eq!(rx.counter(), 0);

        let ct = tx.encrypt(b"after rekey").unwrap();
        let pt = rx.decrypt(&ct).unwrap();
        assert_eq!(pt, b"after rekey");
    }
}
