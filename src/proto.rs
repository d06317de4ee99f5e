//! Hand-authored `prost::Message` structs for the handshake and pairing control
//! messages. The toolchain in this environment cannot run `protoc`/`build.rs` codegen,
//! so these mirror the teacher's `handshake_proto.rs` pattern: minimal structs with
//! explicit field tags, authored directly rather than generated. Chat-message *payload*
//! bytes themselves are out of scope and stay opaque `Bytes` everywhere in this crate.

/// `ClientHello`: the first Noise_XX message, carrying the client's ephemeral public key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHello {
    #[prost(bytes = "vec", tag = "1")]
    pub ephemeral: ::prost::alloc::vec::Vec<u8>,
}

/// `ServerHello`: the second Noise_XX message, carrying the server's ephemeral key, its
/// encrypted static key, and an encrypted certificate chain proving the static key's
/// authenticity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerHello {
    #[prost(bytes = "vec", tag = "1")]
    pub ephemeral: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub encrypted_static: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub encrypted_certificate: ::prost::alloc::vec::Vec<u8>,
}

/// `CertChain`: a two-level signed certificate binding the server's Noise static key to
/// WhatsApp's trusted issuer key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CertChain {
    #[prost(message, optional, tag = "1")]
    pub leaf: Option<cert_chain::NoiseCertificate>,
    #[prost(message, optional, tag = "2")]
    pub intermediate: Option<cert_chain::NoiseCertificate>,
}

pub mod cert_chain {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NoiseCertificateDetails {
        #[prost(uint32, tag = "1")]
        pub serial: u32,
        #[prost(bytes = "vec", tag = "2")]
        pub key: ::prost::alloc::vec::Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub issuer_serial: ::prost::alloc::vec::Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NoiseCertificate {
        #[prost(bytes = "vec", tag = "1")]
        pub details: ::prost::alloc::vec::Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub signature: ::prost::alloc::vec::Vec<u8>,
    }
}

/// `ClientFinish`: the third Noise_XX message, carrying the client's encrypted static key
/// and a `ClientPayload` with device/user-agent metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientFinish {
    #[prost(bytes = "vec", tag = "1")]
    pub encrypted_static: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub encrypted_payload: ::prost::alloc::vec::Vec<u8>,
}

/// Device and session metadata sent inside the encrypted client-finish payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientPayload {
    #[prost(uint32, tag = "1")]
    pub registration_id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub identity_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signed_pre_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub signed_pre_key_id: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub signed_pre_key_signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "6")]
    pub platform: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub user_agent: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "8")]
    pub push_name: Option<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "9")]
    pub one_time_pre_keys: ::prost::alloc::vec::Vec<PreKeyRecordProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreKeyRecordProto {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
}

/// `PairDeviceMessage`: sent by the server once the primary device has confirmed a QR
/// scan or pairing code, assigning this device its JID/LID and the primary's account
/// signature over this device's identity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PairDeviceMessage {
    #[prost(string, tag = "1")]
    pub assigned_jid: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "2")]
    pub assigned_lid: Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", tag = "3")]
    pub account_signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub account_signature_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, optional, tag = "5")]
    pub business_name: Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "6")]
    pub platform: Option<::prost::alloc::string::String>,
}

/// Sender-key distribution message, sent pairwise to group participants bootstrapping a
/// new sender chain.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SenderKeyDistributionMessage {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub iteration: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub chain_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub signing_key: ::prost::alloc::vec::Vec<u8>,
}
