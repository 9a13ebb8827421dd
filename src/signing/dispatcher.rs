//! Request handling.
//!
//! Routes one decoded request at a time. Signing requests run entirely
//! inside [`ActiveSigner::with_authority`]: the authority check, the
//! watermark check, the signature and the durable watermark write happen
//! under one lock, and the signed response only leaves this module after
//! the write has completed.

use std::sync::Arc;

use crate::authority::ActiveSigner;
use crate::config::{PubKeyPolicy, Role};
use crate::error::{KmsError, KmsResult};
use crate::keystore::{Identity, KeyRing};
use crate::protocol::{ED25519_KEY_TYPE, Message, RemoteSignerError};
use crate::signing::canonical;
use crate::signing::guard;
use crate::signing::types::{Proposal, SigningState, Vote};

/// Stateless request router shared by all endpoint connections.
#[derive(Clone)]
pub struct MessageDispatcher {
    keys: Arc<KeyRing>,
    active: ActiveSigner,
    policy: PubKeyPolicy,
}

impl MessageDispatcher {
    pub fn new(keys: Arc<KeyRing>, active: ActiveSigner, policy: PubKeyPolicy) -> Self {
        Self {
            keys,
            active,
            policy,
        }
    }

    pub fn active(&self) -> &ActiveSigner {
        &self.active
    }

    /// Decode and handle a raw request payload.
    ///
    /// A payload that does not decode is answered with a ping response and
    /// the channel stays up.
    pub fn handle_bytes(&self, role: Role, payload: &[u8]) -> KmsResult<Message> {
        match Message::decode(payload) {
            Ok(request) => self.handle(role, request),
            Err(e) => {
                tracing::warn!(role = %role, error = %e, "Undecodable request, answering with ping");
                Ok(Message::PingResponse)
            }
        }
    }

    /// Handle one request from the endpoint holding `role`.
    ///
    /// Refusals become error responses. `Err` is only returned for failures
    /// the process must not survive, such as a watermark that could not be
    /// persisted.
    pub fn handle(&self, role: Role, request: Message) -> KmsResult<Message> {
        match request {
            Message::PublicKeyRequest { chain_id } => self.public_key(role, &chain_id),
            Message::SignVoteRequest { chain_id, vote } => self.sign_vote(role, &chain_id, vote),
            Message::SignProposalRequest { chain_id, proposal } => {
                self.sign_proposal(role, &chain_id, proposal)
            }
            Message::PingRequest => Ok(Message::PingResponse),
            other => {
                tracing::warn!(role = %role, kind = other.kind(), "Unexpected message, answering with ping");
                Ok(Message::PingResponse)
            }
        }
    }

    fn public_key(&self, role: Role, chain_id: &str) -> KmsResult<Message> {
        let identity = self.public_key_identity(role)?;
        tracing::info!(
            role = %role,
            chain_id,
            address = %identity.address_hex(),
            "Public key request"
        );
        Ok(Message::PublicKeyResponse {
            key_type: ED25519_KEY_TYPE.to_string(),
            key_bytes: identity.public_key().as_bytes().to_vec(),
            error: None,
        })
    }

    fn public_key_identity(&self, role: Role) -> KmsResult<&Identity> {
        let identity = match self.policy {
            PubKeyPolicy::RoleBound => self.keys.identity_for(role),
            PubKeyPolicy::FollowAuthority if self.active.is_active(role)? => self.keys.consensus(),
            PubKeyPolicy::FollowAuthority => self.keys.identity_for(role),
        };
        Ok(identity)
    }

    fn sign_vote(&self, role: Role, chain_id: &str, mut vote: Vote) -> KmsResult<Message> {
        let hrs = vote.hrs();
        let result = vote.validate().and_then(|()| {
            self.active.with_authority(role, |store| {
                guard::check(store.current(), &hrs).into_result()?;

                let key = self.keys.consensus();
                let sign_bytes = canonical::vote_sign_bytes(chain_id, &vote);
                vote.signature = key.try_sign(&sign_bytes)?.to_bytes().to_vec();

                if !vote.extension.is_empty() {
                    let ext_bytes = canonical::vote_extension_sign_bytes(chain_id, &vote);
                    vote.extension_signature = key.try_sign(&ext_bytes)?.to_bytes().to_vec();
                }

                store.write(SigningState::from_signed_vote(chain_id, &vote))
            })
        });

        match result {
            Ok(()) => {
                tracing::info!(
                    role = %role,
                    chain_id,
                    height = vote.height,
                    round = vote.round,
                    msg_type = %vote.msg_type,
                    block_hash = %hex::encode_upper(&vote.block_id.hash),
                    "Signed vote"
                );
                Ok(Message::SignedVoteResponse {
                    vote: Some(vote),
                    error: None,
                })
            }
            Err(e) => Ok(Message::SignedVoteResponse {
                vote: None,
                error: Some(refusal(role, chain_id, "vote", e)?),
            }),
        }
    }

    fn sign_proposal(
        &self,
        role: Role,
        chain_id: &str,
        mut proposal: Proposal,
    ) -> KmsResult<Message> {
        let hrs = proposal.hrs();
        let result = proposal.validate().and_then(|()| {
            self.active.with_authority(role, |store| {
                guard::check(store.current(), &hrs).into_result()?;

                let sign_bytes = canonical::proposal_sign_bytes(chain_id, &proposal);
                proposal.signature = self
                    .keys
                    .consensus()
                    .try_sign(&sign_bytes)?
                    .to_bytes()
                    .to_vec();

                store.write(SigningState::from_signed_proposal(chain_id, &proposal))
            })
        });

        match result {
            Ok(()) => {
                tracing::info!(
                    role = %role,
                    chain_id,
                    height = proposal.height,
                    round = proposal.round,
                    block_hash = %hex::encode_upper(&proposal.block_id.hash),
                    "Signed proposal"
                );
                Ok(Message::SignedProposalResponse {
                    proposal: Some(proposal),
                    error: None,
                })
            }
            Err(e) => Ok(Message::SignedProposalResponse {
                proposal: None,
                error: Some(refusal(role, chain_id, "proposal", e)?),
            }),
        }
    }
}

/// Log a refused signing request and build the error sent back.
///
/// Fatal errors are returned unchanged so the caller stops serving.
fn refusal(role: Role, chain_id: &str, what: &str, err: KmsError) -> KmsResult<RemoteSignerError> {
    match &err {
        KmsError::DoubleSign { requested, stored } => {
            tracing::error!(
                role = %role,
                chain_id,
                requested = %requested,
                stored = %stored,
                "Double-sign attempt rejected for {what}"
            );
        }
        KmsError::NotActive(_) => {
            tracing::warn!(role = %role, chain_id, "Ignoring {what} request from inactive endpoint");
        }
        e if e.is_fatal() => {
            tracing::error!(role = %role, error = %e, code = e.error_code(), "Cannot sign {what}, stopping");
            return Err(err);
        }
        e => {
            tracing::warn!(role = %role, chain_id, error = %e, code = e.error_code(), "Refused {what} request");
        }
    }
    Ok(err.to_remote_error())
}
