//! Canonical sign-bytes for votes, vote extensions and proposals.
//!
//! Produces the length-delimited protobuf encodings of `CanonicalVote`,
//! `CanonicalVoteExtension` and `CanonicalProposal` that consensus peers
//! reconstruct to verify a signature. A nil block id is left out; the
//! timestamp is always present.

use prost::Message as _;

use crate::proto::{self, types as pb};
use crate::signing::types::{BlockId, Proposal, Vote};

/// `CanonicalBlockID`, or `None` for a nil block.
fn canonical_block_id(block_id: &BlockId) -> Option<pb::CanonicalBlockId> {
    if block_id.is_zero() {
        return None;
    }

    Some(pb::CanonicalBlockId {
        hash: block_id.hash.clone(),
        part_set_header: Some(pb::CanonicalPartSetHeader {
            total: block_id.part_set_header.total,
            hash: block_id.part_set_header.hash.clone(),
        }),
    })
}

/// Bytes signed for a prevote or precommit.
pub fn vote_sign_bytes(chain_id: &str, vote: &Vote) -> Vec<u8> {
    pb::CanonicalVote {
        r#type: vote.msg_type.code(),
        height: vote.height,
        round: i64::from(vote.round),
        block_id: canonical_block_id(&vote.block_id),
        timestamp: Some(proto::timestamp(&vote.timestamp)),
        chain_id: chain_id.to_string(),
    }
    .encode_length_delimited_to_vec()
}

/// Bytes signed for a vote extension.
pub fn vote_extension_sign_bytes(chain_id: &str, vote: &Vote) -> Vec<u8> {
    pb::CanonicalVoteExtension {
        extension: vote.extension.clone(),
        height: vote.height,
        round: i64::from(vote.round),
        chain_id: chain_id.to_string(),
    }
    .encode_length_delimited_to_vec()
}

/// Bytes signed for a block proposal.
pub fn proposal_sign_bytes(chain_id: &str, proposal: &Proposal) -> Vec<u8> {
    pb::CanonicalProposal {
        r#type: proposal.msg_type.code(),
        height: proposal.height,
        round: i64::from(proposal.round),
        pol_round: i64::from(proposal.pol_round),
        block_id: canonical_block_id(&proposal.block_id),
        timestamp: Some(proto::timestamp(&proposal.timestamp)),
        chain_id: chain_id.to_string(),
    }
    .encode_length_delimited_to_vec()
}
