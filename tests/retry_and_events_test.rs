use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use wa_rs::binary::{BinaryNode, NodeContent};
use wa_rs::config::{RetryConfig, SignalConfig};
use wa_rs::events::{Event, EventBus};
use wa_rs::identity::DeviceIdentity;
use wa_rs::jid::Jid;
use wa_rs::pipeline::{MessagePipeline, OutboundDevice};
use wa_rs::retry::{build_retry_receipt, RetryEngine};
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

/// A tampered-in-flight message fails to decrypt, which should: (1) surface a
/// `DecryptionFailure` event instead of a `Message` event, and (2) be eligible for a retry
/// receipt via the `RetryEngine`, producing a well-formed `<receipt type="retry">` stanza.
#[tokio::test]
async fn decryption_failure_triggers_event_and_retry_receipt() -> anyhow::Result<()> {
    let alice_identity = DeviceIdentity::generate(2);
    let bob_identity = DeviceIdentity::generate(2);
    let bob_bundle = bundle_from(&bob_identity);

    let alice_engine = SignalEngine::new(Arc::new(InMemorySignalStore::new()), SignalConfig::default());
    let bob_store = Arc::new(InMemorySignalStore::new());
    bob_store.seed_pre_keys(bob_identity.one_time_pre_keys.values().cloned());
    let bob_engine = SignalEngine::new(bob_store, SignalConfig::default());

    let bob_device = Jid::parse("5511999999999@s.whatsapp.net")?;
    let alice_device = Jid::parse("5511888888888@s.whatsapp.net")?;

    alice_engine
        .init_outbound_session(&bob_device.to_string(), &alice_identity, &bob_bundle)
        .await?;
    let alice_pipeline = MessagePipeline::new(alice_engine);

    let recipients = alice_pipeline
        .encrypt_outbound(
            &[OutboundDevice { device: bob_device.clone(), is_new_session: true }],
            b"confidential",
        )
        .await?;
    let stanza = alice_pipeline.build_stanza(&bob_device, "tampered-1", &recipients);

    let mut enc_ciphertext = match &stanza.child_by_tag("enc").unwrap().content {
        NodeContent::Bytes(b) => b.clone().to_vec(),
        _ => anyhow::bail!("expected bytes"),
    };
    let original_message: wa_rs::signal::ratchet::SignalMessage = serde_json::from_slice(&enc_ciphertext)?;

    bob_engine
        .init_inbound_session(
            &alice_device.to_string(),
            &bob_identity,
            bob_bundle.one_time_pre_key_id,
            alice_identity.identity_key.public,
            original_message.ratchet_pub,
        )
        .await?;
    let bob_pipeline = MessagePipeline::new(bob_engine);

    // Flip a byte deep inside the serialized ciphertext so the MAC check fails on decrypt.
    let flip_at = enc_ciphertext.len() - 3;
    enc_ciphertext[flip_at] ^= 0xFF;
    let tampered_node = BinaryNode::new("message")
        .with_children(vec![BinaryNode::new("enc").with_bytes(enc_ciphertext)]);

    let events = EventBus::new(true);
    let message_events = Arc::new(AtomicUsize::new(0));
    let failure_events = Arc::new(AtomicUsize::new(0));
    {
        let message_events = message_events.clone();
        let failure_events = failure_events.clone();
        events
            .subscribe(move |event| {
                let message_events = message_events.clone();
                let failure_events = failure_events.clone();
                async move {
                    match event {
                        Event::Message { .. } => {
                            message_events.fetch_add(1, Ordering::SeqCst);
                        }
                        Event::DecryptionFailure { .. } => {
                            failure_events.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                }
            })
            .await;
    }

    let retry_engine = RetryEngine::new(RetryConfig { max_attempts: 3, initial_backoff_ms: 10, max_backoff_ms: 1_000 });

    match bob_pipeline.decrypt_inbound(&alice_device, "tampered-1", &tampered_node).await {
        Ok(_) => anyhow::bail!("tampered ciphertext must not decrypt"),
        Err(err) => {
            events
                .dispatch(Event::DecryptionFailure {
                    from: alice_device.clone(),
                    id: "tampered-1".to_owned(),
                    reason: err.to_string(),
                })
                .await;
        }
    }

    assert_eq!(message_events.load(Ordering::SeqCst), 0);
    assert_eq!(failure_events.load(Ordering::SeqCst), 1);

    assert!(retry_engine.try_record_attempt(&alice_device.to_string(), "tampered-1"));
    let receipt = build_retry_receipt(&alice_device, "tampered-1", 1, &bob_device);
    assert_eq!(receipt.tag, "receipt");
    assert_eq!(receipt.attr("type"), Some("retry"));
    assert_eq!(receipt.child_by_tag("retry").and_then(|n| n.attr("count")), Some("1"));

    Ok(())
}
