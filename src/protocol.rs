//! Wire protocol between the signer and a consensus node.
//!
//! Messages are CometBFT `privval.Message` protobufs. Each one travels as a
//! single length-delimited payload on a
//! [`SecretConnection`](crate::transport::SecretConnection). Responses carry
//! an optional [`RemoteSignerError`] instead of a signature when the request
//! was refused.

use prost::Message as _;

use crate::error::{KmsError, KmsResult};
use crate::proto::crypto::{PublicKey, public_key};
use crate::proto::privval::{self as pb, message::Sum};
use crate::signing::types::{Proposal, Vote};

/// Key type reported in public-key responses.
pub const ED25519_KEY_TYPE: &str = "ed25519";

/// Key type of the other `PublicKey` variant a node may send.
pub const SECP256K1_KEY_TYPE: &str = "secp256k1";

/// Structured refusal returned to the consensus node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSignerError {
    pub code: i32,
    pub description: String,
}

impl From<&RemoteSignerError> for pb::RemoteSignerError {
    fn from(err: &RemoteSignerError) -> Self {
        Self {
            code: err.code,
            description: err.description.clone(),
        }
    }
}

impl From<pb::RemoteSignerError> for RemoteSignerError {
    fn from(err: pb::RemoteSignerError) -> Self {
        Self {
            code: err.code,
            description: err.description,
        }
    }
}

/// All messages exchanged over a signer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    PublicKeyRequest {
        chain_id: String,
    },
    PublicKeyResponse {
        key_type: String,
        key_bytes: Vec<u8>,
        error: Option<RemoteSignerError>,
    },
    SignVoteRequest {
        chain_id: String,
        vote: Vote,
    },
    SignedVoteResponse {
        vote: Option<Vote>,
        error: Option<RemoteSignerError>,
    },
    SignProposalRequest {
        chain_id: String,
        proposal: Proposal,
    },
    SignedProposalResponse {
        proposal: Option<Proposal>,
        error: Option<RemoteSignerError>,
    },
    PingRequest,
    PingResponse,
}

impl Message {
    /// Encode for the wire. The length prefix is added by the channel.
    pub fn encode(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }

    /// Decode a payload received from the wire.
    pub fn decode(bytes: &[u8]) -> KmsResult<Self> {
        Self::from_proto(pb::Message::decode(bytes)?)
    }

    fn to_proto(&self) -> pb::Message {
        let sum = match self {
            Self::PublicKeyRequest { chain_id } => Sum::PubKeyRequest(pb::PubKeyRequest {
                chain_id: chain_id.clone(),
            }),
            Self::PublicKeyResponse {
                key_type,
                key_bytes,
                error,
            } => Sum::PubKeyResponse(pb::PubKeyResponse {
                pub_key: (!key_bytes.is_empty()).then(|| public_key_proto(key_type, key_bytes)),
                error: error.as_ref().map(Into::into),
            }),
            Self::SignVoteRequest { chain_id, vote } => Sum::SignVoteRequest(pb::SignVoteRequest {
                vote: Some(vote.into()),
                chain_id: chain_id.clone(),
            }),
            Self::SignedVoteResponse { vote, error } => {
                Sum::SignedVoteResponse(pb::SignedVoteResponse {
                    vote: vote.as_ref().map(Into::into),
                    error: error.as_ref().map(Into::into),
                })
            }
            Self::SignProposalRequest { chain_id, proposal } => {
                Sum::SignProposalRequest(pb::SignProposalRequest {
                    proposal: Some(proposal.into()),
                    chain_id: chain_id.clone(),
                })
            }
            Self::SignedProposalResponse { proposal, error } => {
                Sum::SignedProposalResponse(pb::SignedProposalResponse {
                    proposal: proposal.as_ref().map(Into::into),
                    error: error.as_ref().map(Into::into),
                })
            }
            Self::PingRequest => Sum::PingRequest(pb::PingRequest {}),
            Self::PingResponse => Sum::PingResponse(pb::PingResponse {}),
        };
        pb::Message { sum: Some(sum) }
    }

    fn from_proto(message: pb::Message) -> KmsResult<Self> {
        let sum = message
            .sum
            .ok_or_else(|| KmsError::Deserialization("empty privval message".to_string()))?;

        Ok(match sum {
            Sum::PubKeyRequest(req) => Self::PublicKeyRequest {
                chain_id: req.chain_id,
            },
            Sum::PubKeyResponse(resp) => {
                let (key_type, key_bytes) = match resp.pub_key.and_then(|key| key.sum) {
                    Some(public_key::Sum::Ed25519(bytes)) => (ED25519_KEY_TYPE, bytes),
                    Some(public_key::Sum::Secp256k1(bytes)) => (SECP256K1_KEY_TYPE, bytes),
                    None => (ED25519_KEY_TYPE, Vec::new()),
                };
                Self::PublicKeyResponse {
                    key_type: key_type.to_string(),
                    key_bytes,
                    error: resp.error.map(Into::into),
                }
            }
            Sum::SignVoteRequest(req) => Self::SignVoteRequest {
                chain_id: req.chain_id,
                vote: req
                    .vote
                    .ok_or_else(|| KmsError::Deserialization("sign vote request without vote".to_string()))?
                    .try_into()?,
            },
            Sum::SignedVoteResponse(resp) => Self::SignedVoteResponse {
                vote: resp.vote.map(Vote::try_from).transpose()?,
                error: resp.error.map(Into::into),
            },
            Sum::SignProposalRequest(req) => Self::SignProposalRequest {
                chain_id: req.chain_id,
                proposal: req
                    .proposal
                    .ok_or_else(|| {
                        KmsError::Deserialization("sign proposal request without proposal".to_string())
                    })?
                    .try_into()?,
            },
            Sum::SignedProposalResponse(resp) => Self::SignedProposalResponse {
                proposal: resp.proposal.map(Proposal::try_from).transpose()?,
                error: resp.error.map(Into::into),
            },
            Sum::PingRequest(_) => Self::PingRequest,
            Sum::PingResponse(_) => Self::PingResponse,
        })
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PublicKeyRequest { .. } => "public_key_request",
            Self::PublicKeyResponse { .. } => "public_key_response",
            Self::SignVoteRequest { .. } => "sign_vote_request",
            Self::SignedVoteResponse { .. } => "signed_vote_response",
            Self::SignProposalRequest { .. } => "sign_proposal_request",
            Self::SignedProposalResponse { .. } => "signed_proposal_response",
            Self::PingRequest => "ping_request",
            Self::PingResponse => "ping_response",
        }
    }

    /// Error carried by a response, if any.
    pub fn error(&self) -> Option<&RemoteSignerError> {
        match self {
            Self::PublicKeyResponse { error, .. }
            | Self::SignedVoteResponse { error, .. }
            | Self::SignedProposalResponse { error, .. } => error.as_ref(),
            _ => None,
        }
    }
}

fn public_key_proto(key_type: &str, key_bytes: &[u8]) -> PublicKey {
    let sum = if key_type == SECP256K1_KEY_TYPE {
        public_key::Sum::Secp256k1(key_bytes.to_vec())
    } else {
        public_key::Sum::Ed25519(key_bytes.to_vec())
    };
    PublicKey { sum: Some(sum) }
}
