//! QR and phone-number pairing state machine. A fresh link starts in `AwaitingQrScan`,
//! rotating its payload roughly every 20 seconds for up to 6 rotations before giving up;
//! phone-number pairing instead hands the user a short alphanumeric code out of band.
//! Either path ends the same way: the primary device signs our identity key and the
//! server assigns us a durable JID, verified via [`crate::keys::verify_message`].

use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};

use crate::error::PairingError;
use crate::identity::DeviceIdentity;
use crate::jid::Jid;
use crate::keys::verify_message;
use crate::proto::PairDeviceMessage;
use crate::qr::generate_qr_string;

pub const QR_ROTATION_INTERVAL: Duration = Duration::from_secs(20);
pub const MAX_QR_ROTATIONS: u32 = 6;

const PHONE_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone)]
pub enum PairingState {
    AwaitingQrScan { payload: String, rotation: u32, issued_at: Instant },
    AwaitingPhoneCode { code: String },
    Paired { jid: Jid },
    Failed,
}

pub struct PairingMachine {
    state: PairingState,
}

impl PairingMachine {
    /// Starts a fresh QR pairing flow, generating the first payload.
    pub fn start_qr(identity: &DeviceIdentity, reference: &str) -> Self {
        let payload = generate_qr_string(
            reference,
            &identity.noise_key.public,
            &identity.identity_key.public,
            &identity.adv_secret,
        );
        Self {
            state: PairingState::AwaitingQrScan { payload, rotation: 0, issued_at: Instant::now() },
        }
    }

    /// Starts a phone-number pairing flow with a freshly generated 8-character code,
    /// rendered by the caller as four groups the way WA's companion apps display it.
    pub fn start_phone_code() -> Self {
        Self { state: PairingState::AwaitingPhoneCode { code: generate_phone_pairing_code() } }
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    /// Whether the current QR payload has aged past its rotation interval.
    pub fn qr_needs_rotation(&self) -> bool {
        matches!(
            &self.state,
            PairingState::AwaitingQrScan { issued_at, .. } if issued_at.elapsed() >= QR_ROTATION_INTERVAL
        )
    }

    /// Rotates to a fresh QR payload using a new server-issued reference. Fails once the
    /// rotation budget is exhausted, at which point the caller should surface a timeout.
    pub fn rotate_qr(&mut self, identity: &DeviceIdentity, reference: &str) -> Result<&str, PairingError> {
        let rotation = match &self.state {
            PairingState::AwaitingQrScan { rotation, .. } => *rotation + 1,
            _ => return Err(PairingError::AlreadyPairing),
        };
        if rotation >= MAX_QR_ROTATIONS {
            self.state = PairingState::Failed;
            return Err(PairingError::QrExhausted);
        }

        let payload = generate_qr_string(
            reference,
            &identity.noise_key.public,
            &identity.identity_key.public,
            &identity.adv_secret,
        );
        self.state = PairingState::AwaitingQrScan { payload, rotation, issued_at: Instant::now() };
        match &self.state {
            PairingState::AwaitingQrScan { payload, .. } => Ok(payload.as_str()),
            _ => unreachable!(),
        }
    }

    /// Verifies the primary device's signature over our identity key and, on success,
    /// transitions to `Paired` with the server-assigned JID.
    pub fn complete(
        &mut self,
        message: &PairDeviceMessage,
        our_identity_public: [u8; 32],
    ) -> Result<Jid, PairingError> {
        let signature_key: [u8; 32] = message
            .account_signature_key
            .as_slice()
            .try_into()
            .map_err(|_| PairingError::BadAccountSignature)?;

        if !verify_message(signature_key, &our_identity_public, &message.account_signature) {
            self.state = PairingState::Failed;
            return Err(PairingError::BadAccountSignature);
        }

        let jid = match Jid::parse(&message.assigned_jid) {
            Ok(jid) => jid,
            Err(_) => {
                self.state = PairingState::Failed;
                return Err(PairingError::Rejected("invalid assigned jid".into()));
            }
        };
        self.state = PairingState::Paired { jid: jid.clone() };
        Ok(jid)
    }
}

/// How often [`run_qr_pairing`] checks whether the current payload needs rotating.
const QR_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Drives a QR pairing flow to completion, dispatching [`Event::QrCode`] on every fresh
/// payload and [`Event::PairError`] when the rotation budget runs out. Returns once the
/// machine leaves `AwaitingQrScan` — either because `complete_pairing` moved it to `Paired`
/// from another task handling the inbound pair-success stanza, or because rotation failed.
/// `next_reference` supplies a fresh server-issued reference for each rotation.
pub async fn run_qr_pairing(
    events: &crate::events::EventBus,
    machine: &tokio::sync::Mutex<PairingMachine>,
    identity: &DeviceIdentity,
    mut next_reference: impl FnMut() -> String,
) {
    {
        let guard = machine.lock().await;
        if let PairingState::AwaitingQrScan { payload, rotation, .. } = guard.state() {
            events.dispatch(crate::events::Event::QrCode { payload: payload.clone(), rotation: *rotation }).await;
        }
    }

    loop {
        tokio::time::sleep(QR_POLL_INTERVAL).await;
        let mut guard = machine.lock().await;
        let current = guard.state().clone();
        match current {
            PairingState::Paired { jid } => {
                drop(guard);
                events.dispatch(crate::events::Event::Paired { jid }).await;
                return;
            }
            PairingState::Failed => {
                drop(guard);
                events.dispatch(crate::events::Event::PairError { reason: "qr pairing failed".into() }).await;
                return;
            }
            PairingState::AwaitingQrScan { .. } if guard.qr_needs_rotation() => {
                let reference = next_reference();
                match guard.rotate_qr(identity, &reference) {
                    Ok(payload) => {
                        let payload = payload.to_owned();
                        let rotation = match guard.state() {
                            PairingState::AwaitingQrScan { rotation, .. } => *rotation,
                            _ => 0,
                        };
                        drop(guard);
                        events.dispatch(crate::events::Event::QrCode { payload, rotation }).await;
                    }
                    Err(PairingError::QrExhausted) => {
                        drop(guard);
                        events
                            .dispatch(crate::events::Event::PairError { reason: "qr rotation budget exhausted".into() })
                            .await;
                        return;
                    }
                    Err(_) => {}
                }
            }
            _ => {}
        }
    }
}

/// Verifies and applies an inbound pair-success message, dispatching [`Event::Paired`] or
/// [`Event::PairError`] to match the outcome — the counterpart to [`run_qr_pairing`] for the
/// half of the flow driven by a server stanza rather than a timer.
pub async fn complete_pairing(
    events: &crate::events::EventBus,
    machine: &tokio::sync::Mutex<PairingMachine>,
    message: &PairDeviceMessage,
    our_identity_public: [u8; 32],
) -> Result<Jid, PairingError> {
    let result = machine.lock().await.complete(message, our_identity_public);
    match &result {
        Ok(jid) => events.dispatch(crate::events::Event::Paired { jid: jid.clone() }).await,
        Err(err) => {
            events
                .dispatch(crate::events::Event::PairError { reason: err.to_string() })
                .await
        }
    }
    result
}

fn generate_phone_pairing_code() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| PHONE_CODE_ALPHABET[(*b as usize) % PHONE_CODE_ALPHABET.len()] as char).collect()
}
