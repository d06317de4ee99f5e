//! Curve25519 keypairs and the XEdDSA-style signing scheme used for signed pre-keys,
//! device identity signatures, and WA certificate verification.

use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE, edwards::CompressedEdwardsY, montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 keypair used throughout the handshake and Signal primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: [u8; 32],
    pub private: [u8; 32],
}

impl KeyPair {
    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret).to_bytes();
        Self { public, private }
    }

    pub fn as_static_secret(&self) -> StaticSecret {
        StaticSecret::from(self.private)
    }

    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        self.as_static_secret()
            .diffie_hellman(&PublicKey::from(*their_public))
            .to_bytes()
    }
}

/// Generates a new random X25519 keypair.
pub fn generate_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    KeyPair {
        public,
        private: secret.to_bytes(),
    }
}

/// Generates a random 31-bit registration identifier, fixed for the lifetime of the
/// device identity.
pub fn generate_registration_id() -> u32 {
    let mut raw = [0_u8; 4];
    OsRng.fill_bytes(&mut raw);
    u32::from_le_bytes(raw) & 0x7FFF_FFFF
}

/// Prefix used by libsignal-compatible wire encodings of public keys.
pub const KEY_BUNDLE_TYPE: u8 = 5;

/// Prepends the libsignal key-bundle prefix to a 32-byte public key.
pub fn signal_public_key(public: &[u8; 32]) -> [u8; 33] {
    let mut out = [0_u8; 33];
    out[0] = KEY_BUNDLE_TYPE;
    out[1..].copy_from_slice(public);
    out
}

/// Signs an arbitrary message with a Curve25519 private key using the XEdDSA scheme
/// (Curve25519 keys reinterpreted as Ed25519-compatible signatures).
pub fn sign_message(private: [u8; 32], public: [u8; 32], message: &[u8]) -> [u8; 64] {
    let secret = Scalar::from_bytes_mod_order(private);
    let nonce = hash_to_scalar(&[&private, &public, message]);
    let nonce_point = (&nonce * ED25519_BASEPOINT_TABLE).compress().to_bytes();
    let challenge = hash_to_scalar(&[&nonce_point, &public, message]);
    let s = nonce + challenge * secret;

    let mut out = [0_u8; 64];
    out[..32].copy_from_slice(&nonce_point);
    out[32..].copy_from_slice(&s.to_bytes());
    out
}

/// Verifies a signature produced by [`sign_message`] or a pure Ed25519 signature (used by
/// the server's certificate chain, which signs with a dedicated Ed25519 issuer key).
pub fn verify_message(public: [u8; 32], message: &[u8], signature: &[u8]) -> bool {
    if signature.len() != 64 {
        return false;
    }

    if let Ok(verifying_key) = VerifyingKey::from_bytes(&public) {
        if let Ok(sig) = Signature::from_slice(signature) {
            if verifying_key.verify(message, &sig).is_ok() {
                return true;
            }
        }
    }

    verify_xeddsa(public, message, signature)
}

fn verify_xeddsa(public: [u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let mut r_bytes = [0_u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    let Some(r_point) = CompressedEdwardsY(r_bytes).decompress() else {
        return false;
    };

    let mut s_bytes = [0_u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) else {
        return false;
    };

    let mont = MontgomeryPoint(public);
    let challenge = hash_to_scalar(&[&r_bytes, &public, message]);
    let lhs = &s * ED25519_BASEPOINT_TABLE;
    for sign in [0, 1] {
        let Some(a_point) = mont.to_edwards(sign) else {
            continue;
        };
        let rhs = r_point + (challenge * a_point);
        if lhs == rhs {
            return true;
        }
    }

    false
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }

    let mut wide = [0_u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_id_uses_31_bits() {
        for _ in 0..64 {
            let id = generate_registration_id();
            assert_eq!(id & 0x8000_0000, 0);
        }
    }

    #[test]
    fn xeddsa_sign_and_verify_round_trips() {
        let kp = generate_keypair();
        let message = b"signed pre key payload";
        let sig = sign_message(kp.private, kp.public, message);
        assert!(verify_message(kp.public, message, &sig));
    }

    #[test]
    fn xeddsa_rejects_tampered_message() {
        let kp = generate_keypair();
        let sig = sign_message(kp.private, kp.public, b"original");
        assert!(!verify_message(kp.public, b"tampered", &sig));
    }

    #[test]
    fn diffie_hellman_is_symmetric() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_eq!(a.diffie_hellman(&b.public), b.diffie_hellman(&a.public));
    }
}
