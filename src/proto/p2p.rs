//! Secret connection handshake messages.

use super::crypto::PublicKey;

/// `google.protobuf.BytesValue`, carrying an ephemeral X25519 key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BytesValue {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
}

/// `tendermint.p2p.AuthSigMessage`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthSigMessage {
    #[prost(message, optional, tag = "1")]
    pub pub_key: Option<PublicKey>,
    #[prost(bytes = "vec", tag = "2")]
    pub sig: Vec<u8>,
}
