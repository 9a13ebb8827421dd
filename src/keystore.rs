//! Validator key material.
//!
//! Loads the consensus key from a `priv_validator_key.json` style file and,
//! in HA mode, provides the identity the standby endpoint authenticates with.
//!
//! ## Key File Format
//!
//! ```json
//! {
//!   "address": "<upper-hex, 20 bytes>",
//!   "pub_key":  { "type": "tendermint/PubKeyEd25519",  "value": "<base64, 32 bytes>" },
//!   "priv_key": { "type": "tendermint/PrivKeyEd25519", "value": "<base64, 64 bytes>" }
//! }
//! ```
//!
//! The private value is the 32-byte seed followed by the 32-byte public key.

use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::config::Role;
use crate::error::{KmsError, KmsResult};

pub const PRIV_KEY_TYPE: &str = "tendermint/PrivKeyEd25519";
pub const PUB_KEY_TYPE: &str = "tendermint/PubKeyEd25519";

/// Length of the private key value: seed followed by public key.
const KEYPAIR_LENGTH: usize = ed25519_dalek::KEYPAIR_LENGTH;

#[derive(Deserialize)]
struct TypedValue {
    #[serde(rename = "type")]
    key_type: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct KeyFile {
    #[serde(default)]
    address: Option<String>,
    pub_key: Option<TypedValue>,
    priv_key: TypedValue,
}

/// An ed25519 identity bound to an endpoint role.
pub struct Identity {
    role: Role,
    signing_key: SigningKey,
}

impl Identity {
    /// Wrap an existing key.
    pub fn new(role: Role, signing_key: SigningKey) -> Self {
        Self { role, signing_key }
    }

    /// Generate a fresh identity that only lives in memory.
    pub fn generate(role: Role) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let identity = Self::new(role, signing_key);
        tracing::info!(
            role = %role,
            public_key = %identity.public_key_hex_prefix(),
            "Generated in-memory identity"
        );
        identity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Validator address: first 20 bytes of SHA-256 of the public key.
    pub fn address(&self) -> [u8; 20] {
        address_of(&self.public_key())
    }

    /// Address as upper-case hex, the form used in key files.
    pub fn address_hex(&self) -> String {
        hex::encode_upper(self.address())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Sign, reporting failure as an error instead of panicking.
    pub fn try_sign(&self, message: &[u8]) -> KmsResult<Signature> {
        self.signing_key
            .try_sign(message)
            .map_err(|e| KmsError::SigningFailed(e.to_string()))
    }

    fn public_key_hex_prefix(&self) -> String {
        hex::encode_upper(&self.public_key().as_bytes()[..12])
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("role", &self.role)
            .field("public_key", &hex::encode(self.public_key().as_bytes()))
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

/// First 20 bytes of SHA-256 over an ed25519 public key.
pub fn address_of(public_key: &VerifyingKey) -> [u8; 20] {
    let digest = Sha256::digest(public_key.as_bytes());
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[..20]);
    address
}

/// Load and validate an identity from a key file.
pub fn load(path: &Path, role: Role) -> KmsResult<Identity> {
    let raw = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
        KmsError::KeyLoad(format!("failed to read key file {}: {e}", path.display()))
    })?);

    let file: KeyFile = serde_json::from_str(&raw)
        .map_err(|e| KmsError::KeyLoad(format!("failed to parse key file: {e}")))?;

    let identity = parse(&file, role)?;

    tracing::info!(
        role = %role,
        address = %identity.address_hex(),
        path = %path.display(),
        "Loaded signing key"
    );
    Ok(identity)
}

fn parse(file: &KeyFile, role: Role) -> KmsResult<Identity> {
    if file.priv_key.key_type != PRIV_KEY_TYPE {
        return Err(KmsError::KeyLoad(format!(
            "unsupported private key type '{}', expected '{PRIV_KEY_TYPE}'",
            file.priv_key.key_type
        )));
    }

    let secret = Zeroizing::new(
        BASE64
            .decode(file.priv_key.value.trim())
            .map_err(|e| KmsError::KeyLoad(format!("private key is not valid base64: {e}")))?,
    );
    if secret.is_empty() {
        return Err(KmsError::KeyLoad("private key data is empty".to_string()));
    }
    let keypair: Zeroizing<[u8; KEYPAIR_LENGTH]> =
        Zeroizing::new(secret.as_slice().try_into().map_err(|_| {
            KmsError::KeyLoad(format!(
                "invalid private key length: expected {KEYPAIR_LENGTH}, got {}",
                secret.len()
            ))
        })?);

    // Rejects a key whose trailing public half does not match its seed.
    let signing_key = SigningKey::from_keypair_bytes(&keypair)
        .map_err(|e| KmsError::KeyLoad(format!("inconsistent private key: {e}")))?;
    let identity = Identity::new(role, signing_key);

    if let Some(pub_key) = &file.pub_key {
        if pub_key.key_type != PUB_KEY_TYPE {
            return Err(KmsError::KeyLoad(format!(
                "unsupported public key type '{}', expected '{PUB_KEY_TYPE}'",
                pub_key.key_type
            )));
        }
        let declared = BASE64
            .decode(pub_key.value.trim())
            .map_err(|e| KmsError::KeyLoad(format!("public key is not valid base64: {e}")))?;
        if declared.as_slice() != identity.public_key().as_bytes() {
            return Err(KmsError::KeyLoad(
                "public key does not match private key".to_string(),
            ));
        }
    }

    if let Some(address) = file.address.as_deref().filter(|a| !a.is_empty())
        && !address.eq_ignore_ascii_case(&identity.address_hex())
    {
        return Err(KmsError::KeyLoad(format!(
            "address {address} does not match key (derived {})",
            identity.address_hex()
        )));
    }

    Ok(identity)
}

/// The identities available to the signer.
///
/// Signatures are only ever produced with the consensus key. The standby
/// identity authenticates the standby endpoint and answers its public-key
/// queries while it is not active.
#[derive(Debug)]
pub struct KeyRing {
    consensus: Identity,
    standby: Option<Identity>,
}

impl KeyRing {
    /// Single-endpoint key ring.
    pub fn single(consensus: Identity) -> Self {
        Self {
            consensus,
            standby: None,
        }
    }

    /// HA key ring with a standby identity.
    pub fn with_standby(consensus: Identity, standby: Identity) -> Self {
        Self {
            consensus,
            standby: Some(standby),
        }
    }

    /// Load the consensus key and, when HA is enabled, the standby identity.
    ///
    /// Without a standby key file the standby identity is generated in
    /// memory and never persisted.
    pub fn load(
        key_file: &Path,
        standby_key_file: Option<&Path>,
        ha_enabled: bool,
    ) -> KmsResult<Self> {
        let consensus = load(key_file, Role::Primary)?;
        if !ha_enabled {
            return Ok(Self::single(consensus));
        }

        let standby = match standby_key_file {
            Some(path) => load(path, Role::Standby)?,
            None => Identity::generate(Role::Standby),
        };
        Ok(Self::with_standby(consensus, standby))
    }

    /// The key every real signature is produced with.
    pub fn consensus(&self) -> &Identity {
        &self.consensus
    }

    /// Identity configured for an endpoint role.
    ///
    /// Falls back to the consensus key when no standby identity exists.
    pub fn identity_for(&self, role: Role) -> &Identity {
        match role {
            Role::Primary => &self.consensus,
            Role::Standby => self.standby.as_ref().unwrap_or(&self.consensus),
        }
    }
}
