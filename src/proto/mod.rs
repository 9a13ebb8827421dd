//! Protobuf messages exchanged with CometBFT nodes.
//!
//! `prost` definitions for the parts of the `tendermint.types`,
//! `tendermint.crypto`, `tendermint.p2p` and `tendermint.privval` packages
//! (CometBFT v0.38) the signer speaks. Field tags follow the upstream
//! `.proto` files.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

use crate::error::{KmsError, KmsResult};

pub mod crypto;
pub mod p2p;
pub mod privval;
pub mod types;

/// Seconds of 0001-01-01T00:00:00Z, what a node sends for an unset time.
pub const ZERO_TIME_SECONDS: i64 = -62_135_596_800;

#[allow(clippy::cast_possible_wrap)]
pub fn timestamp(time: &DateTime<Utc>) -> Timestamp {
    // Subsecond nanos stay below 2e9, inside i32.
    Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a wire timestamp. An absent one is the node's zero time.
pub fn datetime(timestamp: Option<Timestamp>) -> KmsResult<DateTime<Utc>> {
    let Timestamp { seconds, nanos } = timestamp.unwrap_or(Timestamp {
        seconds: ZERO_TIME_SECONDS,
        nanos: 0,
    });
    u32::try_from(nanos)
        .ok()
        .and_then(|nanos| DateTime::from_timestamp(seconds, nanos))
        .ok_or_else(|| {
            KmsError::Deserialization(format!("timestamp out of range: {seconds}s {nanos}ns"))
        })
}
