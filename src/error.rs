//! Crate-level error taxonomy. Each subsystem owns its own enum; [`Error`] composes
//! them the way the teacher's `HandshakeError` composes `TransportError`/`NoiseError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JidError {
    #[error("malformed jid: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to connect transport: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("invalid framed payload: {0}")]
    InvalidFrame(&'static str),
    #[error("payload exceeds max 24-bit frame size")]
    FrameTooLarge,
    #[error("zlib inflate failed")]
    Inflate,
    #[error("transport closed by peer")]
    Closed,
}

#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("cipher error")]
    Cipher,
    #[error("invalid key material")]
    InvalidKeyMaterial,
    #[error("nonce counter exhausted, rekey required")]
    CounterExhausted,
}

#[derive(Debug, Error)]
pub enum BinaryNodeError {
    #[error("unexpected end of payload")]
    UnexpectedEof,
    #[error("invalid symbol type: {0}")]
    InvalidSymbolType(u8),
    #[error("invalid content type: {0}")]
    InvalidContentType(u8),
    #[error("invalid utf-8 symbol")]
    InvalidUtf8,
    #[error("unknown single-byte token index: {0}")]
    UnknownSingleByteToken(u8),
    #[error("unknown double-byte token index: {0}")]
    UnknownDoubleByteToken(u16),
    #[error("unknown jid server token: {0}")]
    UnknownJidServerToken(u8),
    #[error("invalid nibble digit: {0}")]
    InvalidNibble(u8),
    #[error("symbol exceeds max length")]
    SymbolTooLong,
    #[error("payload exceeds max length")]
    PayloadTooLarge,
    #[error("too many attributes for a single node")]
    TooManyAttributes,
    #[error("too many nested child nodes")]
    TooManyChildren,
    #[error("trailing bytes after node decode")]
    TrailingBytes,
    #[error("attribute lookup failed during encode")]
    AttributeLookupFailed,
    #[error(transparent)]
    Jid(#[from] JidError),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error("handshake proto decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("handshake payload encode failed: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("missing handshake field: {0}")]
    MissingField(&'static str),
    #[error("invalid handshake key length for {0}")]
    InvalidKeyLength(&'static str),
    #[error("server certificate chain failed verification")]
    UntrustedCertificate,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("no session for address {0}")]
    NoSession(String),
    #[error("identity for {0} changed and is untrusted under the current policy")]
    UntrustedIdentity(String),
    #[error("one-time pre-key {0} already consumed or unknown")]
    PreKeyConsumed(u32),
    #[error("signed pre-key signature verification failed")]
    BadSignedPreKeySignature,
    #[error("message key for counter {0} not found (too old or already used)")]
    MissingMessageKey(u32),
    #[error("ciphertext authentication failed")]
    BadMac,
    #[error("malformed ciphertext envelope")]
    MalformedCiphertext,
    #[error("sender-key distribution missing for {0}")]
    MissingSenderKey(String),
    #[error("sender-key signature verification failed")]
    BadSenderKeySignature,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing already in progress")]
    AlreadyPairing,
    #[error("qr code rotation exhausted without a scan")]
    QrExhausted,
    #[error("account signature from primary device failed verification")]
    BadAccountSignature,
    #[error("server rejected pairing: {0}")]
    Rejected(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("request timed out")]
    Timeout,
    #[error("connection closed while awaiting reply")]
    Disconnected,
    #[error("server returned iq error {code}: {text}")]
    IqError { code: u16, text: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no recipient devices resolved for send")]
    NoRecipients,
    #[error("failed to fetch pre-keys for one or more recipients")]
    PrekeysFetchFailed,
    #[error("server rejected stanza: {0}")]
    ServerErrorNode(String),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    BinaryNode(#[from] BinaryNodeError),
}

/// Top-level crate error returned by connection lifecycle and public API operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("not connected")]
    NotConnected,
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("iq timed out")]
    IqTimedOut,
    #[error("iq error {code}: {text}")]
    IqError { code: u16, text: String },
    #[error("invalid jid: {0}")]
    InvalidJid(#[from] JidError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    BinaryNode(#[from] BinaryNodeError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error("router error: {0}")]
    Router(#[source] RouterError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RouterError> for Error {
    fn from(value: RouterError) -> Self {
        match value {
            RouterError::Timeout => Error::IqTimedOut,
            RouterError::Disconnected => Error::Disconnected("request router closed".into()),
            RouterError::IqError { code, text } => Error::IqError { code, text },
        }
    }
}
