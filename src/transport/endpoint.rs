//! Endpoint addresses.
//!
//! Accepted forms:
//! - `tcp://host:port` or plain `host:port`
//! - `unix:///path/to/socket`
//!
//! A TCP address may carry a `<node-id>@` prefix, the lower-hex of the first
//! 20 bytes of SHA-256 over the node's ed25519 key. When present, the key the
//! node authenticates with during the handshake must match it.

use std::path::PathBuf;

use ed25519_dalek::VerifyingKey;
use tokio::net::TcpStream;

use crate::config::Role;
use crate::error::{KmsError, KmsResult};
use crate::keystore::address_of;
use crate::transport::Transport;

/// Network location of a consensus node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A configured consensus-node endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    role: Role,
    address: Address,
    peer_id: Option<[u8; 20]>,
}

impl Endpoint {
    pub fn new(role: Role, address: Address) -> Self {
        Self {
            role,
            address,
            peer_id: None,
        }
    }

    /// Parse an address string for the given role.
    pub fn parse(role: Role, raw: &str) -> KmsResult<Self> {
        let raw = raw.trim();

        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(KmsError::Config(format!("missing socket path in '{raw}'")));
            }
            return Ok(Self::new(role, Address::Unix(PathBuf::from(path))));
        }

        let rest = raw.strip_prefix("tcp://").unwrap_or(raw);
        if rest.contains("://") {
            return Err(KmsError::Config(format!(
                "unsupported scheme in '{raw}', expected tcp:// or unix://"
            )));
        }

        let (peer_id, host_port) = match rest.split_once('@') {
            Some((id, host_port)) => (Some(parse_peer_id(id)?), host_port),
            None => (None, rest),
        };

        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| KmsError::Config(format!("missing port in '{raw}'")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(KmsError::Config(format!("missing host in '{raw}'")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| KmsError::Config(format!("invalid port in '{raw}': {e}")))?;

        Ok(Self {
            role,
            address: Address::Tcp {
                host: host.to_string(),
                port,
            },
            peer_id,
        })
    }

    /// Pin the expected node identity.
    #[must_use]
    pub fn with_peer_id(mut self, peer_id: [u8; 20]) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn peer_id(&self) -> Option<&[u8; 20]> {
        self.peer_id.as_ref()
    }

    /// Open the raw byte stream to this endpoint.
    pub async fn dial(&self) -> KmsResult<Box<dyn Transport>> {
        match &self.address {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| KmsError::Dial(format!("{}: {e}", self.address)))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| KmsError::Dial(format!("{}: {e}", self.address)))?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| KmsError::Dial(format!("{}: {e}", self.address)))?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(KmsError::Dial(format!(
                "{}: unix sockets are not supported on this platform",
                self.address
            ))),
        }
    }

    /// Check the authenticated remote key against the pinned node id.
    pub fn verify_peer(&self, remote: &VerifyingKey) -> KmsResult<()> {
        let Some(expected) = &self.peer_id else {
            return Ok(());
        };
        let actual = address_of(remote);
        if &actual != expected {
            return Err(KmsError::PeerMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.address, self.role)
    }
}

fn parse_peer_id(raw: &str) -> KmsResult<[u8; 20]> {
    let bytes =
        hex::decode(raw).map_err(|e| KmsError::Config(format!("invalid node id '{raw}': {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        KmsError::Config(format!(
            "invalid node id '{raw}': expected 20 bytes, got {}",
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn test_parse_tcp_forms() {
        let with_scheme = Endpoint::parse(Role::Primary, "tcp://127.0.0.1:26659").unwrap();
        let bare = Endpoint::parse(Role::Primary, "127.0.0.1:26659").unwrap();
        assert_eq!(with_scheme, bare);
        assert_eq!(
            with_scheme.address(),
            &Address::Tcp {
                host: "127.0.0.1".to_string(),
                port: 26659
            }
        );
        assert!(with_scheme.peer_id().is_none());
    }

    #[test]
    fn test_parse_unix() {
        let endpoint = Endpoint::parse(Role::Standby, "unix:///run/kms.sock").unwrap();
        assert_eq!(
            endpoint.address(),
            &Address::Unix(PathBuf::from("/run/kms.sock"))
        );
        assert_eq!(endpoint.role(), Role::Standby);
        assert_eq!(endpoint.to_string(), "unix:///run/kms.sock (standby)");
    }

    #[test]
    fn test_parse_peer_id() {
        let id = "0123456789abcdef0123456789abcdef01234567";
        let endpoint = Endpoint::parse(Role::Primary, &format!("tcp://{id}@node:26659")).unwrap();
        assert_eq!(hex::encode(endpoint.peer_id().unwrap()), id);
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        assert!(Endpoint::parse(Role::Primary, "tcp://127.0.0.1").is_err());
        assert!(Endpoint::parse(Role::Primary, "tcp://:26659").is_err());
        assert!(Endpoint::parse(Role::Primary, "tcp://host:notaport").is_err());
        assert!(Endpoint::parse(Role::Primary, "grpc://host:1").is_err());
        assert!(Endpoint::parse(Role::Primary, "unix://").is_err());
        assert!(Endpoint::parse(Role::Primary, "tcp://abcd@host:1").is_err());
    }

    #[test]
    fn test_verify_peer() {
        let node_key = SigningKey::from_bytes(&[3; 32]).verifying_key();
        let other_key = SigningKey::from_bytes(&[4; 32]).verifying_key();

        let unpinned = Endpoint::parse(Role::Primary, "127.0.0.1:1").unwrap();
        assert!(unpinned.verify_peer(&other_key).is_ok());

        let pinned = unpinned.with_peer_id(address_of(&node_key));
        assert!(pinned.verify_peer(&node_key).is_ok());
        let err = pinned.verify_peer(&other_key).unwrap_err();
        assert!(matches!(err, KmsError::PeerMismatch { .. }));
    }
}
