//! KMS configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before any key is
//! read or any socket is opened. A standby address switches the signer into
//! HA mode with two supervised endpoints.
//!
//! ## Environment Variables
//!
//! - `KMS_PRIMARY_ADDR`: Primary consensus-node endpoint (required),
//!   e.g. `tcp://127.0.0.1:26659` or `tcp://<node-id>@10.0.0.5:26659`
//! - `KMS_STANDBY_ADDR`: Standby endpoint (optional, enables HA mode)
//! - `KMS_KEY_FILE`: Consensus key file (default: `./priv_validator_key.json`)
//! - `KMS_STANDBY_KEY_FILE`: Standby identity key file (optional)
//! - `KMS_STATE_FILE`: Watermark file (default: `./.data/kms_state.json`)
//! - `KMS_RETRY_INTERVAL_MS`: Reconnect backoff (default: 2000)
//! - `KMS_HANDSHAKE_TIMEOUT_MS`: Dial + handshake deadline (default: 10000)
//! - `KMS_PUBKEY_POLICY`: "follow-authority" or "role-bound"
//! - `RUST_LOG`: Log level filter

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::Endpoint;

const DEFAULT_KEY_FILE: &str = "./priv_validator_key.json";
const DEFAULT_STATE_FILE: &str = "./.data/kms_state.json";
const DEFAULT_RETRY_INTERVAL_MS: u64 = 2_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Helper to turn an empty env var into `None`.
fn env_opt(name: &str) -> Option<String> {
    let value = env_trim(name);
    if value.is_empty() { None } else { Some(value) }
}

/// Endpoint role: which configured identity a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds signing authority at startup.
    Primary,
    /// Takes over signing authority when the primary link is lost.
    Standby,
}

impl Role {
    /// The role that would take over from this one.
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Standby,
            Self::Standby => Self::Primary,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "standby" | "secondary" => Ok(Self::Standby),
            other => Err(format!(
                "Invalid role '{other}'. Must be 'primary' or 'standby'."
            )),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Standby => write!(f, "standby"),
        }
    }
}

/// Which public key an endpoint is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PubKeyPolicy {
    /// The active endpoint gets the consensus key, the inactive one its own
    /// role identity.
    #[default]
    FollowAuthority,
    /// Every endpoint always gets the identity configured for its role.
    RoleBound,
}

impl FromStr for PubKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "follow-authority" => Ok(Self::FollowAuthority),
            "role-bound" => Ok(Self::RoleBound),
            other => Err(format!(
                "Invalid pubkey policy '{other}'. Must be 'follow-authority' or 'role-bound'."
            )),
        }
    }
}

impl std::fmt::Display for PubKeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FollowAuthority => write!(f, "follow-authority"),
            Self::RoleBound => write!(f, "role-bound"),
        }
    }
}

/// KMS configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    primary_addr: String,
    standby_addr: Option<String>,
    key_file: PathBuf,
    standby_key_file: Option<PathBuf>,
    state_file: PathBuf,
    retry_interval_ms: u64,
    handshake_timeout_ms: u64,
    pubkey_policy: PubKeyPolicy,
    pubkey_policy_error: Option<String>,
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Self {
        let primary_addr = env_trim("KMS_PRIMARY_ADDR");
        let standby_addr = env_opt("KMS_STANDBY_ADDR");

        let key_file = env_opt("KMS_KEY_FILE")
            .map_or_else(|| PathBuf::from(DEFAULT_KEY_FILE), PathBuf::from);
        let standby_key_file = env_opt("KMS_STANDBY_KEY_FILE").map(PathBuf::from);
        let state_file = env_opt("KMS_STATE_FILE")
            .map_or_else(|| PathBuf::from(DEFAULT_STATE_FILE), PathBuf::from);

        let retry_interval_ms = env_trim("KMS_RETRY_INTERVAL_MS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_RETRY_INTERVAL_MS);
        let handshake_timeout_ms = env_trim("KMS_HANDSHAKE_TIMEOUT_MS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);

        // An unrecognized policy must not silently fall back to the default.
        let (pubkey_policy, pubkey_policy_error) = match env_opt("KMS_PUBKEY_POLICY") {
            None => (PubKeyPolicy::default(), None),
            Some(raw) => match raw.parse::<PubKeyPolicy>() {
                Ok(policy) => (policy, None),
                Err(e) => (PubKeyPolicy::default(), Some(e)),
            },
        };

        Self {
            primary_addr,
            standby_addr,
            key_file,
            standby_key_file,
            state_file,
            retry_interval_ms,
            handshake_timeout_ms,
            pubkey_policy,
            pubkey_policy_error,
        }
    }

    /// Create settings for tests with explicit endpoints and file paths.
    pub fn for_tests(
        primary_addr: &str,
        standby_addr: Option<&str>,
        key_file: PathBuf,
        state_file: PathBuf,
    ) -> Self {
        Self {
            primary_addr: primary_addr.to_string(),
            standby_addr: standby_addr.map(String::from),
            key_file,
            standby_key_file: None,
            state_file,
            retry_interval_ms: 50,
            handshake_timeout_ms: 2_000,
            pubkey_policy: PubKeyPolicy::FollowAuthority,
            pubkey_policy_error: None,
        }
    }

    /// Override the pubkey policy.
    #[must_use]
    pub fn with_pubkey_policy(mut self, policy: PubKeyPolicy) -> Self {
        self.pubkey_policy = policy;
        self
    }

    /// Override the standby key file.
    #[must_use]
    pub fn with_standby_key_file(mut self, path: PathBuf) -> Self {
        self.standby_key_file = Some(path);
        self
    }

    /// Validate settings.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.primary_addr.is_empty() {
            return Err("KMS_PRIMARY_ADDR is required. \
                 Provide the consensus node's privval address, e.g. tcp://127.0.0.1:26659."
                .to_string());
        }

        if let Some(e) = &self.pubkey_policy_error {
            return Err(format!("KMS_PUBKEY_POLICY configuration error: {e}"));
        }

        if self.retry_interval_ms == 0 {
            return Err("KMS_RETRY_INTERVAL_MS must be greater than zero.".to_string());
        }

        if self.handshake_timeout_ms == 0 {
            return Err("KMS_HANDSHAKE_TIMEOUT_MS must be greater than zero.".to_string());
        }

        let endpoints = self.endpoints()?;
        if let [primary, standby] = endpoints.as_slice()
            && primary.address() == standby.address()
        {
            return Err("KMS_STANDBY_ADDR must differ from KMS_PRIMARY_ADDR.".to_string());
        }

        if self.standby_key_file.is_some() && !self.ha_enabled() {
            return Err("KMS_STANDBY_KEY_FILE is set but KMS_STANDBY_ADDR is not. \
                 A standby identity is only used in HA mode."
                .to_string());
        }

        Ok(())
    }

    /// Parse the configured endpoints, primary first.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, String> {
        let mut endpoints = vec![
            Endpoint::parse(Role::Primary, &self.primary_addr)
                .map_err(|e| format!("KMS_PRIMARY_ADDR: {e}"))?,
        ];

        if let Some(addr) = &self.standby_addr {
            endpoints.push(
                Endpoint::parse(Role::Standby, addr)
                    .map_err(|e| format!("KMS_STANDBY_ADDR: {e}"))?,
            );
        }

        Ok(endpoints)
    }

    // Getters

    pub fn primary_addr(&self) -> &str {
        &self.primary_addr
    }

    pub fn standby_addr(&self) -> Option<&str> {
        self.standby_addr.as_deref()
    }

    pub fn key_file(&self) -> &PathBuf {
        &self.key_file
    }

    pub fn standby_key_file(&self) -> Option<&PathBuf> {
        self.standby_key_file.as_ref()
    }

    pub fn state_file(&self) -> &PathBuf {
        &self.state_file
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn pubkey_policy(&self) -> PubKeyPolicy {
        self.pubkey_policy
    }

    /// Check if a standby endpoint is configured.
    pub fn ha_enabled(&self) -> bool {
        self.standby_addr.is_some()
    }
}
