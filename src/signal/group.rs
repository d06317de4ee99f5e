//! Sender-key group messaging: a single per-sender chain fans out to every device in the
//! group instead of pairwise double-ratchet sessions. Each sender signs its ciphertexts
//! with a per-session Ed25519-style signing key so recipients can authenticate the chain
//! without re-verifying the sender's Signal identity on every message.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::SignalError;
use crate::keys::{sign_message, verify_message};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];

/// State for one sender-key chain: either our own (if we own the group signing key) or a
/// remote participant's, installed from a `SenderKeyDistributionMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeySession {
    pub id: u32,
    pub chain_key: [u8; 32],
    pub iteration: u32,
    pub signing_public: [u8; 32],
    /// Present only for sessions we originated; `None` for installed remote sessions.
    pub signing_private: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyMessage {
    pub id: u32,
    pub iteration: u32,
    pub ciphertext: Vec<u8>,
    pub signature: [u8; 64],
}

impl SenderKeySession {
    /// Creates a fresh chain for a group we're originating messages into, owning the
    /// signing key so we can later prove authorship of every message in the chain.
    pub fn generate(id: u32) -> Self {
        let signing_key = crate::keys::generate_keypair();
        let mut chain_key = [0u8; 32];
        rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut chain_key);

        Self {
            id,
            chain_key,
            iteration: 0,
            signing_public: signing_key.public,
            signing_private: Some(signing_key.private),
        }
    }

    /// Installs a chain distributed by a remote participant; we can verify and decrypt
    /// but never sign as this sender.
    pub fn from_distribution(id: u32, iteration: u32, chain_key: [u8; 32], signing_public: [u8; 32]) -> Self {
        Self { id, chain_key, iteration, signing_public, signing_private: None }
    }

    fn advance(&mut self) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.chain_key).expect("hmac accepts any key length");
        mac.update(MESSAGE_KEY_SEED);
        let message_key: [u8; 32] = mac.finalize().into_bytes().into();

        let mut mac = HmacSha256::new_from_slice(&self.chain_key).expect("hmac accepts any key length");
        mac.update(CHAIN_KEY_SEED);
        self.chain_key = mac.finalize().into_bytes().into();
        self.iteration += 1;
        message_key
    }

    /// Encrypts and signs `plaintext`, advancing our chain by one step. Only valid for
    /// sessions we originated (`signing_private.is_some()`).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SenderKeyMessage, SignalError> {
        let signing_private = self
            .signing_private
            .ok_or_else(|| SignalError::MissingSenderKey("cannot sign with an installed remote chain".into()))?;

        let iteration = self.iteration;
        let message_key = self.advance();
        let (enc_key, iv) = expand_message_key(&message_key);

        let ciphertext =
            Aes256CbcEnc::new(&enc_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let signature = sign_message(signing_private, self.signing_public, &ciphertext);

        Ok(SenderKeyMessage { id: self.id, iteration, ciphertext, signature })
    }

    /// Verifies the signature and decrypts, fast-forwarding the chain if `message`'s
    /// iteration is ahead of ours (messages never arrive behind, since the chain only
    /// moves forward and is never reset mid-group-membership).
    pub fn decrypt(&mut self, message: &SenderKeyMessage) -> Result<Vec<u8>, SignalError> {
        if message.id != self.id {
            return Err(SignalError::MissingSenderKey("sender key id mismatch".into()));
        }
        if !verify_message(self.signing_public, &message.ciphertext, &message.signature) {
            return Err(SignalError::BadSenderKeySignature);
        }
        if message.iteration < self.iteration {
            return Err(SignalError::MalformedCiphertext);
        }

        let mut message_key = [0u8; 32];
        while self.iteration <= message.iteration {
            message_key = self.advance();
        }

        let (enc_key, iv) = expand_message_key(&message_key);
        Aes256CbcDec::new(&enc_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&message.ciphertext)
            .map_err(|_| SignalError::MalformedCiphertext)
    }

    /// The distribution payload sent pairwise to each participant when bootstrapping or
    /// rotating this chain.
    pub fn to_distribution(&self) -> (u32, u32, [u8; 32], [u8; 32]) {
        (self.id, self.iteration, self.chain_key, self.signing_public)
    }
}

fn expand_message_key(message_key: &[u8; 32]) -> ([u8; 32], [u8; 16]) {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 48];
    hk.expand(b"wa-rs sender-key", &mut okm).expect("48 is a valid HKDF-SHA256 output length");

    let mut enc_key = [0u8; 32];
    let mut iv = [0u8; 16];
    enc_key.copy_from_slice(&okm[..32]);
    iv.copy_from_slice(&okm[32..]);
    (enc_key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributed_chain_round_trips() {
        let mut owner = SenderKeySession::generate(7);
        let (id, iteration, chain_key, signing_public) = owner.to_distribution();
        let mut recipient = SenderKeySession::from_distribution(id, iteration, chain_key, signing_public);

        let msg = owner.encrypt(b"hello group").unwrap();
        let plaintext = recipient.decrypt(&msg).unwrap();
        assert_eq!(plaintext, b"hello group");
    }

    #[test]
    fn chain_advances_across_multiple_messages() {
        let mut owner = SenderKeySession::generate(1);
        let (id, iteration, chain_key, signing_public) = owner.to_distribution();
        let mut recipient = SenderKeySession::from_distribution(id, iteration, chain_key, signing_public);

        let m1 = owner.encrypt(b"one").unwrap();
        let m2 = owner.encrypt(b"two").unwrap();
        assert_eq!(recipient.decrypt(&m1).unwrap(), b"one");
        assert_eq!(recipient.decrypt(&m2).unwrap(), b"two");
    }

    #[test]
    fn installed_chain_cannot_sign() {
        let owner = SenderKeySession::generate(1);
        let (id, iteration, chain_key, signing_public) = owner.to_distribution();
        let mut recipient = SenderKeySession::from_distribution(id, iteration, chain_key, signing_public);
        assert!(recipient.encrypt(b"not allowed").is_err());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mut owner = SenderKeySession::generate(1);
        let (id, iteration, chain_key, signing_public) = owner.to_distribution();
        let mut recipient = SenderKeySession::from_distribution(id, iteration, chain_key, signing_public);

        let mut msg = owner.encrypt(b"hello").unwrap();
        msg.ciphertext[0] ^= 0xFF;
        assert!(matches!(recipient.decrypt(&msg), Err(SignalError::BadSenderKeySignature)));
    }
}
