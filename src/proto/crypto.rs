//! `tendermint.crypto`

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicKey {
    #[prost(oneof = "public_key::Sum", tags = "1, 2")]
    pub sum: Option<public_key::Sum>,
}

pub mod public_key {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Sum {
        #[prost(bytes, tag = "1")]
        Ed25519(Vec<u8>),
        #[prost(bytes, tag = "2")]
        Secp256k1(Vec<u8>),
    }
}

impl PublicKey {
    pub fn ed25519(key: &[u8]) -> Self {
        Self {
            sum: Some(public_key::Sum::Ed25519(key.to_vec())),
        }
    }
}
