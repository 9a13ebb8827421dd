//! Storage layer for the KMS.
//!
//! The only state that must survive a crash is the signing watermark. It is
//! kept in a single human-readable JSON file, replaced atomically on every
//! write.

pub mod state_file;

pub use self::state_file::SigningStateStore;
