//! Rust core for the WhatsApp multi-device protocol: Noise transport, the binary node
//! wire codec, the Signal double-ratchet/sender-key engine, pairing, and the connection
//! lifecycle around them. This crate is a library — embedding applications own the HTTP
//! surface, persistence backends, and UI around it.

pub mod binary;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handshake;
pub mod identity;
pub mod jid;
pub mod keys;
pub mod noise;
pub mod pairing;
pub mod pipeline;
pub mod proto;
pub mod qr;
pub mod retry;
pub mod router;
pub mod signal;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod version;

pub use config::Config;
pub use connection::Connection;
pub use error::Error;
pub use jid::Jid;

/// Initializes the crate's tracing subscriber from `RUST_LOG`, the same opt-in idiom the
/// teacher uses at its process entrypoint. Embedding applications that already manage
/// their own subscriber should skip this and just depend on the `tracing` spans directly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
