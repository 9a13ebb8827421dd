// Crate-level lint configuration
// Allow noisy pedantic/cargo lints that aren't worth fixing individually
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::missing_panics_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., KmsError in error mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs
#![allow(clippy::missing_const_for_fn)] // Often debatable, runtime doesn't benefit

//! CometBFT Remote Signer (KMS)
//!
//! Keeps a validator's consensus key out of the validator node. The signer
//! dials the node's privval endpoint, authenticates over an encrypted
//! channel and answers public-key, vote and proposal signing requests.
//!
//! ## Architecture
//!
//! - **ConnectionSupervisor**: one task per endpoint. Dials, handshakes,
//!   serves requests, and redials after a fixed backoff.
//!
//! - **SigningAuthority**: decides which endpoint role (primary or standby)
//!   may obtain signatures, and fails over when the active link is lost.
//!
//! - **MessageDispatcher**: answers requests. Signing checks authority and
//!   the watermark, signs, and persists the watermark before replying.
//!
//! ## Safety Model
//!
//! - **Watermark**: the last signed height/round/step is persisted with
//!   fsync before a signature leaves the process. Anything not strictly
//!   above it is refused.
//! - **Single authority**: the active role and the watermark share one lock.
//!   There is no state in which both endpoints may sign.
//! - **Fail closed**: a state file that cannot be read or written stops the
//!   process.

pub mod authority;
pub mod config;
pub mod error;
pub mod keystore;
pub mod proto;
pub mod protocol;
pub mod shutdown;
pub mod signer;
pub mod signing;
pub mod storage;
pub mod supervisor;
pub mod transport;

#[cfg(feature = "otel")]
pub mod telemetry;

#[cfg(not(feature = "otel"))]
pub mod telemetry {
    //! Stub telemetry module when OpenTelemetry is disabled.

    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    /// Initialize tracing with console output only.
    pub fn init_tracing() {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "comet_kms=info,kms=info".into());
        let fmt_layer = tracing_subscriber::fmt::layer();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    /// No-op shutdown when OpenTelemetry is disabled.
    pub fn shutdown_tracing() {}
}

// Re-export commonly used types
pub use config::{PubKeyPolicy, Role, Settings};
pub use error::{KmsError, KmsResult};
pub use shutdown::ShutdownHandle;
pub use signer::Signer;
