//! Consensus message types and the persisted signing watermark.
//!
//! Wire types (`Vote`, `Proposal`, `BlockId`) carry raw bytes and convert
//! to and from their protobuf forms in [`crate::proto::types`]. The watermark
//! (`SigningState`) is written as indented JSON with hex-encoded bytes so an
//! operator can read it.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KmsError, KmsResult};
use crate::proto;

// =============================================================================
// Message Types
// =============================================================================

/// Consensus message type being signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignedMsgType {
    /// Never signed; the type of the bootstrap watermark.
    #[default]
    Unknown,
    Prevote,
    Precommit,
    Proposal,
}

impl SignedMsgType {
    /// Protocol enum value.
    pub fn code(self) -> i32 {
        i32::from(self.to_proto())
    }

    pub fn from_code(code: i32) -> KmsResult<Self> {
        match proto::types::SignedMsgType::try_from(code) {
            Ok(proto::types::SignedMsgType::Unknown) => Ok(Self::Unknown),
            Ok(proto::types::SignedMsgType::Prevote) => Ok(Self::Prevote),
            Ok(proto::types::SignedMsgType::Precommit) => Ok(Self::Precommit),
            Ok(proto::types::SignedMsgType::Proposal) => Ok(Self::Proposal),
            Err(_) => Err(KmsError::Deserialization(format!(
                "unknown signed message type {code}"
            ))),
        }
    }

    fn to_proto(self) -> proto::types::SignedMsgType {
        match self {
            Self::Unknown => proto::types::SignedMsgType::Unknown,
            Self::Prevote => proto::types::SignedMsgType::Prevote,
            Self::Precommit => proto::types::SignedMsgType::Precommit,
            Self::Proposal => proto::types::SignedMsgType::Proposal,
        }
    }

    /// Position of this message within a round.
    ///
    /// A proposal is signed before the prevote, the prevote before the
    /// precommit. The protocol enum values do not follow that order.
    pub fn step(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Proposal => 1,
            Self::Prevote => 2,
            Self::Precommit => 3,
        }
    }

    pub fn is_vote(self) -> bool {
        matches!(self, Self::Prevote | Self::Precommit)
    }
}

impl std::fmt::Display for SignedMsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Prevote => write!(f, "prevote"),
            Self::Precommit => write!(f, "precommit"),
            Self::Proposal => write!(f, "proposal"),
        }
    }
}

/// Height/round/step position of a signature.
///
/// Ordered by height, then round, then step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hrs {
    pub height: i64,
    pub round: i32,
    pub msg_type: SignedMsgType,
}

impl Hrs {
    pub fn new(height: i64, round: i32, msg_type: SignedMsgType) -> Self {
        Self {
            height,
            round,
            msg_type,
        }
    }

    fn key(&self) -> (i64, i32, u8) {
        (self.height, self.round, self.msg_type.step())
    }
}

impl Ord for Hrs {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Hrs {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Hrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "height={} round={} type={}",
            self.height, self.round, self.msg_type
        )
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// Header of the block part set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Vec<u8>,
}

/// Block identifier. The zero value means "nil".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockId {
    pub hash: Vec<u8>,
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    pub fn is_zero(&self) -> bool {
        self.hash.is_empty() && self.part_set_header.hash.is_empty() && self.part_set_header.total == 0
    }
}

/// A prevote or precommit to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub msg_type: SignedMsgType,
    pub height: i64,
    pub round: i32,
    pub block_id: BlockId,
    pub timestamp: DateTime<Utc>,
    pub validator_address: Vec<u8>,
    pub validator_index: i32,
    pub signature: Vec<u8>,
    pub extension: Vec<u8>,
    pub extension_signature: Vec<u8>,
}

impl Vote {
    pub fn hrs(&self) -> Hrs {
        Hrs::new(self.height, self.round, self.msg_type)
    }

    /// Reject votes that cannot be placed on the watermark.
    pub fn validate(&self) -> KmsResult<()> {
        if !self.msg_type.is_vote() {
            return Err(KmsError::InvalidInput(format!(
                "vote has non-vote type {}",
                self.msg_type
            )));
        }
        validate_position(self.height, self.round)
    }
}

/// A block proposal to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub msg_type: SignedMsgType,
    pub height: i64,
    pub round: i32,
    pub pol_round: i32,
    pub block_id: BlockId,
    pub timestamp: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl Proposal {
    pub fn hrs(&self) -> Hrs {
        Hrs::new(self.height, self.round, SignedMsgType::Proposal)
    }

    pub fn validate(&self) -> KmsResult<()> {
        if self.msg_type != SignedMsgType::Proposal {
            return Err(KmsError::InvalidInput(format!(
                "proposal has type {}",
                self.msg_type
            )));
        }
        if self.pol_round < -1 {
            return Err(KmsError::InvalidInput(format!(
                "invalid pol_round {}",
                self.pol_round
            )));
        }
        validate_position(self.height, self.round)
    }
}

fn validate_position(height: i64, round: i32) -> KmsResult<()> {
    if height <= 0 {
        return Err(KmsError::InvalidInput(format!(
            "height must be positive, got {height}"
        )));
    }
    if round < 0 {
        return Err(KmsError::InvalidInput(format!(
            "round must not be negative, got {round}"
        )));
    }
    Ok(())
}

// =============================================================================
// Protobuf Conversions
// =============================================================================

impl From<&BlockId> for proto::types::BlockId {
    fn from(block_id: &BlockId) -> Self {
        Self {
            hash: block_id.hash.clone(),
            part_set_header: Some(proto::types::PartSetHeader {
                total: block_id.part_set_header.total,
                hash: block_id.part_set_header.hash.clone(),
            }),
        }
    }
}

impl From<proto::types::BlockId> for BlockId {
    fn from(block_id: proto::types::BlockId) -> Self {
        let part_set_header = block_id.part_set_header.unwrap_or_default();
        Self {
            hash: block_id.hash,
            part_set_header: PartSetHeader {
                total: part_set_header.total,
                hash: part_set_header.hash,
            },
        }
    }
}

impl From<&Vote> for proto::types::Vote {
    fn from(vote: &Vote) -> Self {
        Self {
            r#type: vote.msg_type.code(),
            height: vote.height,
            round: vote.round,
            block_id: Some((&vote.block_id).into()),
            timestamp: Some(proto::timestamp(&vote.timestamp)),
            validator_address: vote.validator_address.clone(),
            validator_index: vote.validator_index,
            signature: vote.signature.clone(),
            extension: vote.extension.clone(),
            extension_signature: vote.extension_signature.clone(),
        }
    }
}

impl TryFrom<proto::types::Vote> for Vote {
    type Error = KmsError;

    fn try_from(vote: proto::types::Vote) -> KmsResult<Self> {
        Ok(Self {
            msg_type: SignedMsgType::from_code(vote.r#type)?,
            height: vote.height,
            round: vote.round,
            block_id: vote.block_id.map(BlockId::from).unwrap_or_default(),
            timestamp: proto::datetime(vote.timestamp)?,
            validator_address: vote.validator_address,
            validator_index: vote.validator_index,
            signature: vote.signature,
            extension: vote.extension,
            extension_signature: vote.extension_signature,
        })
    }
}

impl From<&Proposal> for proto::types::Proposal {
    fn from(proposal: &Proposal) -> Self {
        Self {
            r#type: proposal.msg_type.code(),
            height: proposal.height,
            round: proposal.round,
            pol_round: proposal.pol_round,
            block_id: Some((&proposal.block_id).into()),
            timestamp: Some(proto::timestamp(&proposal.timestamp)),
            signature: proposal.signature.clone(),
        }
    }
}

impl TryFrom<proto::types::Proposal> for Proposal {
    type Error = KmsError;

    fn try_from(proposal: proto::types::Proposal) -> KmsResult<Self> {
        Ok(Self {
            msg_type: SignedMsgType::from_code(proposal.r#type)?,
            height: proposal.height,
            round: proposal.round,
            pol_round: proposal.pol_round,
            block_id: proposal.block_id.map(BlockId::from).unwrap_or_default(),
            timestamp: proto::datetime(proposal.timestamp)?,
            signature: proposal.signature,
        })
    }
}

// =============================================================================
// Watermark
// =============================================================================

/// Part set header as recorded in the watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SignedPartSetHeader {
    #[serde(with = "hex::serde")]
    pub hash: Vec<u8>,
    pub total: u32,
}

/// The last vote or proposal signed.
///
/// A single latest-value record: every successful sign replaces it entirely.
/// The default value is the bootstrap watermark that everything exceeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SigningState {
    pub chain_id: String,
    pub height: i64,
    pub round: i32,
    #[serde(rename = "type")]
    pub msg_type: SignedMsgType,
    #[serde(with = "hex::serde")]
    pub block_hash: Vec<u8>,
    pub part_set_header: SignedPartSetHeader,
    #[serde(with = "hex::serde")]
    pub validator_address: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub extension_signature: Vec<u8>,
}

impl SigningState {
    pub fn hrs(&self) -> Hrs {
        Hrs::new(self.height, self.round, self.msg_type)
    }

    /// True for the bootstrap watermark written on first run.
    pub fn is_bootstrap(&self) -> bool {
        self.hrs() == Hrs::new(0, 0, SignedMsgType::Unknown) && self.signature.is_empty()
    }

    /// Watermark recorded after signing `vote`.
    pub fn from_signed_vote(chain_id: &str, vote: &Vote) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            height: vote.height,
            round: vote.round,
            msg_type: vote.msg_type,
            block_hash: vote.block_id.hash.clone(),
            part_set_header: SignedPartSetHeader {
                hash: vote.block_id.part_set_header.hash.clone(),
                total: vote.block_id.part_set_header.total,
            },
            validator_address: vote.validator_address.clone(),
            timestamp: vote.timestamp,
            signature: vote.signature.clone(),
            extension_signature: vote.extension_signature.clone(),
        }
    }

    /// Watermark recorded after signing `proposal`.
    pub fn from_signed_proposal(chain_id: &str, proposal: &Proposal) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            height: proposal.height,
            round: proposal.round,
            msg_type: SignedMsgType::Proposal,
            block_hash: proposal.block_id.hash.clone(),
            part_set_header: SignedPartSetHeader {
                hash: proposal.block_id.part_set_header.hash.clone(),
                total: proposal.block_id.part_set_header.total,
            },
            validator_address: Vec::new(),
            timestamp: proposal.timestamp,
            signature: proposal.signature.clone(),
            extension_signature: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hrs_orders_step_within_round() {
        let proposal = Hrs::new(5, 0, SignedMsgType::Proposal);
        let prevote = Hrs::new(5, 0, SignedMsgType::Prevote);
        let precommit = Hrs::new(5, 0, SignedMsgType::Precommit);

        assert!(proposal < prevote);
        assert!(prevote < precommit);
        // A later round beats any step of an earlier one.
        assert!(precommit < Hrs::new(5, 1, SignedMsgType::Proposal));
        assert!(Hrs::new(5, 9, SignedMsgType::Precommit) < Hrs::new(6, 0, SignedMsgType::Unknown));
    }

    #[test]
    fn test_watermark_json_layout() {
        let state = SigningState {
            chain_id: "test-chain".to_string(),
            height: 101,
            round: 0,
            msg_type: SignedMsgType::Prevote,
            block_hash: vec![0xAB, 0xCD],
            ..SigningState::default()
        };

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["type"], "prevote");
        assert_eq!(json["block_hash"], "abcd");
        assert_eq!(json["part_set_header"]["total"], 0);
        assert_eq!(json["signature"], "");
    }

    #[test]
    fn test_default_state_is_bootstrap() {
        assert!(SigningState::default().is_bootstrap());
    }

    #[test]
    fn test_vote_validation() {
        let mut vote = Vote {
            msg_type: SignedMsgType::Prevote,
            height: 1,
            round: 0,
            block_id: BlockId::default(),
            timestamp: Utc::now(),
            validator_address: Vec::new(),
            validator_index: 0,
            signature: Vec::new(),
            extension: Vec::new(),
            extension_signature: Vec::new(),
        };
        assert!(vote.validate().is_ok());

        vote.msg_type = SignedMsgType::Proposal;
        assert!(vote.validate().is_err());

        vote.msg_type = SignedMsgType::Precommit;
        vote.height = 0;
        assert!(vote.validate().is_err());
    }

    #[test]
    fn test_unknown_type_code_rejected() {
        assert_eq!(SignedMsgType::from_code(32).unwrap(), SignedMsgType::Proposal);
        assert_eq!(SignedMsgType::Precommit.code(), 2);
        let err = SignedMsgType::from_code(3).unwrap_err();
        assert!(matches!(err, KmsError::Deserialization(_)));
    }

    #[test]
    fn test_nil_block_id_from_wire() {
        let wire = proto::types::Vote {
            r#type: 1,
            height: 4,
            ..Default::default()
        };
        let vote = Vote::try_from(wire).unwrap();
        assert!(vote.block_id.is_zero());
        assert_eq!(vote.timestamp.timestamp(), proto::ZERO_TIME_SECONDS);
    }
}
