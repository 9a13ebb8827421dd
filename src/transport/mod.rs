//! Connections to consensus-node endpoints.
//!
//! - [`endpoint`]: address parsing and dialing
//! - [`secret_connection`]: the authenticated, encrypted channel on top

pub mod endpoint;
pub mod secret_connection;

use tokio::io::{AsyncRead, AsyncWrite};

pub use self::endpoint::{Address, Endpoint};
pub use self::secret_connection::SecretConnection;

/// Byte stream a secret connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}
