//! Outbound stanza assembly and inbound decryption for chat messages: per-device Signal
//! encryption, PKCS7-style plaintext padding, `<enc>` child construction, and dedup of
//! already-seen inbound message ids. Retry-receipt emission on decryption failure is
//! handled by [`crate::retry`]; this module only classifies the failure and hands it off.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand_core::{OsRng, RngCore};

use crate::binary::{BinaryNode, NodeContent};
use crate::error::PipelineError;
use crate::jid::Jid;
use crate::signal::store::SignalStore;
use crate::signal::SignalEngine;

const MAX_PADDING: u8 = 16;
/// How long a seen message id is remembered for dedup before it's evicted.
const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);

/// Appends 1-16 bytes of padding, each byte equal to the padding length, mirroring the
/// teacher's fixed-width framing elsewhere in the wire codec (PKCS7-shaped, but applied to
/// plaintext rather than a block cipher's input since the AES-CBC layer pads itself).
pub fn pad_plaintext(plaintext: &[u8]) -> Vec<u8> {
    let mut pad_len = 0u8;
    while pad_len == 0 {
        pad_len = (OsRng.next_u32() % MAX_PADDING as u32) as u8 + 1;
    }
    let mut out = Vec::with_capacity(plaintext.len() + pad_len as usize);
    out.extend_from_slice(plaintext);
    out.extend(std::iter::repeat(pad_len).take(pad_len as usize));
    out
}

pub fn strip_padding(padded: &[u8]) -> Result<&[u8], PipelineError> {
    let pad_len = *padded.last().ok_or(PipelineError::NoRecipients)? as usize;
    if pad_len == 0 || pad_len > MAX_PADDING as usize || pad_len > padded.len() {
        return Err(PipelineError::ServerErrorNode("invalid padding".into()));
    }
    Ok(&padded[..padded.len() - pad_len])
}

/// One outbound recipient device plus whether its Signal session was just established for
/// this send (requiring a `pkmsg` envelope so the receiver can locate the embedded X3DH
/// material) or already existed (a ratcheted `msg`). The caller knows this at the
/// `init_outbound_session` vs. cached-session call site, upstream of `encrypt_outbound`.
pub struct OutboundDevice {
    pub device: Jid,
    pub is_new_session: bool,
}

/// One resolved recipient device and the encrypted payload addressed to it.
pub struct EncryptedRecipient {
    pub device: Jid,
    pub enc_type: &'static str,
    pub ciphertext: Vec<u8>,
}

pub struct MessagePipeline<S: SignalStore> {
    signal: SignalEngine<S>,
    seen_ids: Arc<DashMap<String, Instant>>,
}

impl<S: SignalStore> MessagePipeline<S> {
    pub fn new(signal: SignalEngine<S>) -> Self {
        Self { signal, seen_ids: Arc::new(DashMap::new()) }
    }

    /// Encrypts `plaintext` for every device in `devices`, returning one ciphertext per
    /// recipient, tagged `pkmsg` or `msg` per `OutboundDevice::is_new_session`. Devices
    /// without an established session are expected to have had one initiated by the caller
    /// before this is invoked (prekey fetch + session init happens upstream in the
    /// router/engine) with `is_new_session: true` set accordingly.
    pub async fn encrypt_outbound(
        &self,
        devices: &[OutboundDevice],
        plaintext: &[u8],
    ) -> Result<Vec<EncryptedRecipient>, PipelineError> {
        if devices.is_empty() {
            return Err(PipelineError::NoRecipients);
        }
        let padded = pad_plaintext(plaintext);

        let mut out = Vec::with_capacity(devices.len());
        for entry in devices {
            let address = entry.device.to_string();
            let message = self.signal.encrypt(&address, &padded).await?;
            let ciphertext = serde_json::to_vec(&message)
                .map_err(|e| PipelineError::ServerErrorNode(e.to_string()))?;
            let enc_type = if entry.is_new_session { "pkmsg" } else { "msg" };
            out.push(EncryptedRecipient { device: entry.device.clone(), enc_type, ciphertext });
        }
        Ok(out)
    }

    /// Builds the `<message>` stanza wrapping one `<enc>` child per recipient.
    pub fn build_stanza(&self, to: &Jid, message_id: &str, recipients: &[EncryptedRecipient]) -> BinaryNode {
        let children: Vec<BinaryNode> = recipients
            .iter()
            .map(|r| {
                BinaryNode::new("enc")
                    .with_attr("type", r.enc_type)
                    .with_attr("to", r.device.to_string())
                    .with_bytes(r.ciphertext.clone())
            })
            .collect();

        BinaryNode::new("message")
            .with_attr("to", to.to_string())
            .with_attr("id", message_id)
            .with_attr("type", "text")
            .with_children(children)
    }

    /// Decrypts the inbound `<message>` node addressed to us, trying each `<enc>` child in
    /// order and dispatching to the session type its `type` attribute names: `pkmsg`/`msg`
    /// go through the pairwise ratchet, `skmsg` through the sender-key (group) engine.
    /// Deduplicates by the stanza's `id` attribute; returns `None` when the message id has
    /// already been processed.
    pub async fn decrypt_inbound(
        &self,
        from: &Jid,
        message_id: &str,
        node: &BinaryNode,
    ) -> Result<Option<Vec<u8>>, PipelineError> {
        self.evict_expired_dedup_entries();
        if self.seen_ids.contains_key(message_id) {
            return Ok(None);
        }

        let mut last_error = None;
        let address = from.to_string();
        for enc in node.children_by_tag("enc") {
            let ciphertext = match &enc.content {
                NodeContent::Bytes(bytes) => bytes,
                _ => continue,
            };

            let padded = if enc.attr("type") == Some("skmsg") {
                let message = match serde_json::from_slice(ciphertext) {
                    Ok(message) => message,
                    Err(err) => {
                        last_error = Some(PipelineError::ServerErrorNode(err.to_string()));
                        continue;
                    }
                };
                self.signal.decrypt_group(&address, &message).await
            } else {
                let message = match serde_json::from_slice(ciphertext) {
                    Ok(message) => message,
                    Err(err) => {
                        last_error = Some(PipelineError::ServerErrorNode(err.to_string()));
                        continue;
                    }
                };
                self.signal.decrypt(&address, &message).await
            };

            match padded {
                Ok(padded) => {
                    let plaintext = strip_padding(&padded)?.to_vec();
                    self.seen_ids.insert(message_id.to_owned(), Instant::now());
                    return Ok(Some(plaintext));
                }
                Err(err) => last_error = Some(PipelineError::from(err)),
            }
        }

        Err(last_error.unwrap_or_else(|| PipelineError::ServerErrorNode("missing enc child".into())))
    }

    fn evict_expired_dedup_entries(&self) {
        self.seen_ids.retain(|_, seen_at| seen_at.elapsed() < DEDUP_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalConfig;
    use crate::identity::DeviceIdentity;
    use crate::signal::store::InMemorySignalStore;
    use crate::signal::PreKeyBundle;

    fn bundle_from(identity: &DeviceIdentity) -> PreKeyBundle {
        let otp = identity.one_time_pre_keys.values().next().unwrap();
        PreKeyBundle {
            registration_id: identity.registration_id,
            identity_key: identity.identity_key.public,
            signed_pre_key_id: identity.signed_pre_key.id,
            signed_pre_key: identity.signed_pre_key.key_pair.public,
            signed_pre_key_signature: identity.signed_pre_key.signature,
            one_time_pre_key_id: Some(otp.id),
            one_time_pre_key: Some(otp.key_pair.public),
        }
    }

    #[test]
    fn padding_round_trips() {
        for _ in 0..32 {
            let original = b"hello there".to_vec();
            let padded = pad_plaintext(&original);
            assert!(padded.len() > original.len());
            assert_eq!(strip_padding(&padded).unwrap(), original.as_slice());
        }
    }

    #[tokio::test]
    async fn stanza_round_trips_through_pipeline() {
        let alice_identity = DeviceIdentity::generate(3);
        let bob_identity = DeviceIdentity::generate(3);
        let bob_bundle = bundle_from(&bob_identity);

        let alice_store = Arc::new(InMemorySignalStore::new());
        let bob_store = Arc::new(InMemorySignalStore::new());
        bob_store.seed_pre_keys(bob_identity.one_time_pre_keys.values().cloned());
        let alice_engine = SignalEngine::new(alice_store, SignalConfig::default());
        let bob_engine = SignalEngine::new(bob_store, SignalConfig::default());

        let bob_device: Jid = Jid::parse("5511999999999@s.whatsapp.net").unwrap();
        alice_engine
            .init_outbound_session(&bob_device.to_string(), &alice_identity, &bob_bundle)
            .await
            .unwrap();
        let alice_pipeline = MessagePipeline::new(alice_engine);

        let recipients = alice_pipeline
            .encrypt_outbound(
                &[OutboundDevice { device: bob_device.clone(), is_new_session: true }],
                b"hello bob",
            )
            .await
            .unwrap();
        assert_eq!(recipients[0].enc_type, "pkmsg");
        let stanza = alice_pipeline.build_stanza(&bob_device, "msg-1", &recipients);

        let enc_ciphertext = match &stanza.child_by_tag("enc").unwrap().content {
            NodeContent::Bytes(b) => b.clone(),
            _ => panic!("expected bytes content"),
        };
        let message: crate::signal::ratchet::SignalMessage = serde_json::from_slice(&enc_ciphertext).unwrap();

        let alice_device: Jid = Jid::parse("5511888888888@s.whatsapp.net").unwrap();
        bob_engine
            .init_inbound_session(
                &alice_device.to_string(),
                &bob_identity,
                bob_bundle.one_time_pre_key_id,
                alice_identity.identity_key.public,
                message.ratchet_pub,
            )
            .await
            .unwrap();
        let bob_pipeline = MessagePipeline::new(bob_engine);

        let inbound_node = BinaryNode::new("message").with_children(vec![
            BinaryNode::new("enc").with_attr("type", "pkmsg").with_bytes(enc_ciphertext.clone()),
        ]);

        let plaintext = bob_pipeline
            .decrypt_inbound(&alice_device, "msg-1", &inbound_node)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plaintext, b"hello bob");

        // A second delivery with the same id is treated as a dedup no-op.
        let again = bob_pipeline.decrypt_inbound(&alice_device, "msg-1", &inbound_node).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn group_message_dispatches_to_sender_key_decrypt() {
        let group_jid = Jid::parse("120363000000000000@g.us").unwrap();
        let group_address = group_jid.to_string();

        let owner_store = Arc::new(InMemorySignalStore::new());
        let owner = SignalEngine::new(owner_store, SignalConfig::default());
        let session = owner.init_sender_key(&group_address, 1).await.unwrap();
        let (id, iteration, chain_key, signing_public) = session.to_distribution();

        let member_store = Arc::new(InMemorySignalStore::new());
        let member = SignalEngine::new(member_store, SignalConfig::default());
        member.install_sender_key(&group_address, id, iteration, chain_key, signing_public).await.unwrap();
        let member_pipeline = MessagePipeline::new(member);

        let msg = owner.encrypt_group(&group_address, b"hello group").await.unwrap();
        let ciphertext = serde_json::to_vec(&msg).unwrap();
        let inbound_node = BinaryNode::new("message").with_children(vec![
            BinaryNode::new("enc").with_attr("type", "skmsg").with_bytes(ciphertext),
        ]);

        let plaintext = member_pipeline
            .decrypt_inbound(&group_jid, "group-msg-1", &inbound_node)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plaintext, b"hello group");
    }
}
