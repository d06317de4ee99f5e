use std::sync::Arc;

use wa_rs::binary::{decode, encode, NodeContent};
use wa_rs::config::SignalConfig;
use wa_rs::identity::DeviceIdentity;
use wa_rs::jid::Jid;
use wa_rs::pipeline::{MessagePipeline, OutboundDevice};
use wa_rs::signal::store::InMemorySignalStore;
use wa_rs::signal::{PreKeyBundle, SignalEngine};

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

/// A full outbound-to-inbound trip including the actual binary wire codec: the stanza is
/// encoded to bytes and decoded back before the recipient even looks at it, exercising the
/// codec and the Signal engine together the way a real connection would.
#[tokio::test]
async fn message_survives_a_full_wire_round_trip() -> anyhow::Result<()> {
    let alice_identity = DeviceIdentity::generate(4);
    let bob_identity = DeviceIdentity::generate(4);
    let bob_bundle = bundle_from(&bob_identity);

    let alice_engine = SignalEngine::new(Arc::new(InMemorySignalStore::new()), SignalConfig::default());
    let bob_store = Arc::new(InMemorySignalStore::new());
    bob_store.seed_pre_keys(bob_identity.one_time_pre_keys.values().cloned());
    let bob_engine = SignalEngine::new(bob_store, SignalConfig::default());

    let bob_device = Jid::parse("5511999999999@s.whatsapp.net")?;
    alice_engine
        .init_outbound_session(&bob_device.to_string(), &alice_identity, &bob_bundle)
        .await?;
    let alice_pipeline = MessagePipeline::new(alice_engine);

    let recipients = alice_pipeline
        .encrypt_outbound(
            &[OutboundDevice { device: bob_device.clone(), is_new_session: true }],
            b"are we still on for tonight?",
        )
        .await?;
    let stanza = alice_pipeline.build_stanza(&bob_device, "wire-msg-1", &recipients);

    // This is the part that matters: go all the way through the binary codec, not just
    // pass the in-memory BinaryNode straight to the recipient.
    let wire_bytes = encode(&stanza)?;
    let decoded_stanza = decode(&wire_bytes)?;
    assert_eq!(decoded_stanza.attr("id"), Some("wire-msg-1"));

    let enc_ciphertext = match &decoded_stanza.child_by_tag("enc").unwrap().content {
        NodeContent::Bytes(bytes) => bytes.clone(),
        _ => anyhow::bail!("expected an enc payload"),
    };
    let message: wa_rs::signal::ratchet::SignalMessage = serde_json::from_slice(&enc_ciphertext)?;

    let alice_device = Jid::parse("5511888888888@s.whatsapp.net")?;
    bob_engine
        .init_inbound_session(
            &alice_device.to_string(),
            &bob_identity,
            bob_bundle.one_time_pre_key_id,
            alice_identity.identity_key.public,
            message.ratchet_pub,
        )
        .await?;
    let bob_pipeline = MessagePipeline::new(bob_engine);

    let plaintext = bob_pipeline
        .decrypt_inbound(&alice_device, "wire-msg-1", &decoded_stanza)
        .await?
        .expect("first delivery of this id must decrypt");
    assert_eq!(plaintext, b"are we still on for tonight?");

    Ok(())
}
