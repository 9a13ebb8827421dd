//! Signing logic.
//!
//! - [`types`]: votes, proposals and the persisted watermark
//! - [`guard`]: the double-sign check
//! - [`canonical`]: sign-bytes for votes, extensions and proposals
//! - [`dispatcher`]: request routing and the sign-then-persist sequence

pub mod canonical;
pub mod dispatcher;
pub mod guard;
pub mod types;

pub use dispatcher::MessageDispatcher;
pub use guard::Decision;
pub use types::{Hrs, Proposal, SignedMsgType, SigningState, Vote};
