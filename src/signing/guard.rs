//! Double-sign guard.
//!
//! A pure comparison between the persisted watermark and an incoming
//! request. Only requests strictly beyond the watermark may be signed.
//! Re-requesting the exact same height/round/type is rejected even when the
//! payload is identical: the signer keeps no copy of earlier sign-bytes to
//! prove the two are the same.

use crate::error::KmsError;
use crate::signing::types::{Hrs, SigningState};

/// Outcome of a watermark check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Reject { stored: Hrs, requested: Hrs },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Convert a rejection into the error sent back to the peer.
    pub fn into_result(self) -> Result<(), KmsError> {
        match self {
            Self::Allow => Ok(()),
            Self::Reject { stored, requested } => Err(KmsError::DoubleSign { requested, stored }),
        }
    }
}

/// Decide whether `incoming` may be signed given the `stored` watermark.
pub fn check(stored: &SigningState, incoming: &Hrs) -> Decision {
    let stored = stored.hrs();
    if *incoming > stored {
        Decision::Allow
    } else {
        Decision::Reject {
            stored,
            requested: *incoming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::types::SignedMsgType::{self, Precommit, Prevote, Proposal, Unknown};
    use proptest::prelude::*;

    fn watermark(height: i64, round: i32, msg_type: SignedMsgType) -> SigningState {
        SigningState {
            chain_id: "test-chain".to_string(),
            height,
            round,
            msg_type,
            ..SigningState::default()
        }
    }

    #[test]
    fn test_next_height_allowed() {
        let stored = watermark(100, 0, Prevote);
        assert_eq!(check(&stored, &Hrs::new(101, 0, Prevote)), Decision::Allow);
    }

    #[test]
    fn test_replay_rejected() {
        let stored = watermark(100, 0, Prevote);
        let decision = check(&stored, &Hrs::new(100, 0, Prevote));
        assert_eq!(
            decision,
            Decision::Reject {
                stored: Hrs::new(100, 0, Prevote),
                requested: Hrs::new(100, 0, Prevote),
            }
        );
        assert!(decision.into_result().is_err());
    }

    #[test]
    fn test_same_height_round_type_ordering() {
        let stored = watermark(100, 0, Prevote);
        assert!(check(&stored, &Hrs::new(100, 0, Precommit)).is_allowed());
        assert!(!check(&stored, &Hrs::new(100, 0, Proposal)).is_allowed());
    }

    #[test]
    fn test_same_height_greater_round_allowed() {
        let stored = watermark(100, 2, Precommit);
        assert!(check(&stored, &Hrs::new(100, 3, Proposal)).is_allowed());
        assert!(!check(&stored, &Hrs::new(100, 1, Precommit)).is_allowed());
    }

    #[test]
    fn test_lower_height_rejected_regardless_of_round() {
        let stored = watermark(100, 0, Prevote);
        assert!(!check(&stored, &Hrs::new(99, 50, Precommit)).is_allowed());
    }

    #[test]
    fn test_bootstrap_watermark_allows_first_request() {
        let stored = SigningState::default();
        assert!(check(&stored, &Hrs::new(1, 0, Proposal)).is_allowed());
        assert!(!check(&stored, &Hrs::new(0, 0, Unknown)).is_allowed());
    }

    fn any_msg_type() -> impl Strategy<Value = SignedMsgType> {
        prop_oneof![Just(Unknown), Just(Proposal), Just(Prevote), Just(Precommit)]
    }

    fn any_hrs() -> impl Strategy<Value = Hrs> {
        (0i64..50, 0i32..5, any_msg_type()).prop_map(|(h, r, t)| Hrs::new(h, r, t))
    }

    proptest! {
        #[test]
        fn prop_allow_iff_strictly_greater(stored in any_hrs(), incoming in any_hrs()) {
            let state = watermark(stored.height, stored.round, stored.msg_type);
            let expected = (incoming.height, incoming.round, incoming.msg_type.step())
                > (stored.height, stored.round, stored.msg_type.step());
            prop_assert_eq!(check(&state, &incoming).is_allowed(), expected);
        }
    }
}
