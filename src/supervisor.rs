//! Per-endpoint connection supervision.
//!
//! One [`ConnectionSupervisor`] runs per configured endpoint for the life of
//! the process: dial, handshake, serve requests in arrival order, and on any
//! failure wait a fixed interval and start over. Link changes are reported to
//! the signing authority as [`LivenessEvent`]s.
//!
//! Shutdown interrupts the dial, the handshake, a pending read and the
//! backoff sleep. A response write is also abandoned on shutdown; by then the
//! watermark for it is already on disk.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::authority::{CloseSignal, LivenessEvent, SessionClose};
use crate::config::Role;
use crate::error::{KmsError, KmsResult};
use crate::keystore::KeyRing;
use crate::shutdown::Shutdown;
use crate::signing::MessageDispatcher;
use crate::transport::{Endpoint, SecretConnection, Transport};

type Channel = SecretConnection<Box<dyn Transport>>;

/// Observable status of one endpoint link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// A handshaken channel is currently serving.
    pub channel_alive: bool,
    /// Hex public key of the connected node.
    pub remote: Option<String>,
    pub last_error: Option<String>,
    pub retry_backoff: Duration,
    /// Successful handshakes so far.
    pub sessions: u64,
}

/// Why a serving session ended without an error.
enum SessionEnd {
    Shutdown,
    ClosedByAuthority,
}

/// Keeps one endpoint connected and serving.
pub struct ConnectionSupervisor {
    endpoint: Endpoint,
    keys: Arc<KeyRing>,
    dispatcher: MessageDispatcher,
    liveness: mpsc::UnboundedSender<LivenessEvent>,
    close: CloseSignal,
    retry_interval: Duration,
    handshake_timeout: Duration,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionSupervisor {
    pub fn new(
        endpoint: Endpoint,
        keys: Arc<KeyRing>,
        dispatcher: MessageDispatcher,
        liveness: mpsc::UnboundedSender<LivenessEvent>,
        close: CloseSignal,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            endpoint,
            keys,
            dispatcher,
            liveness,
            close,
            retry_interval: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            state,
        }
    }

    #[must_use]
    pub fn with_timing(mut self, retry_interval: Duration, handshake_timeout: Duration) -> Self {
        self.retry_interval = retry_interval;
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn role(&self) -> Role {
        self.endpoint.role()
    }

    /// Watch this endpoint's connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run until shutdown.
    ///
    /// Transport failures are retried forever. Only a fatal error, one the
    /// process must not continue after, ends the loop early.
    pub async fn run(self, mut shutdown: Shutdown) -> KmsResult<()> {
        let span = tracing::info_span!(
            "endpoint",
            role = %self.endpoint.role(),
            addr = %self.endpoint.address()
        );
        async move {
            let result = self.supervise(&mut shutdown).await;
            self.mark_down(None);
            result
        }
        .instrument(span)
        .await
    }

    async fn supervise(&self, shutdown: &mut Shutdown) -> KmsResult<()> {
        while !shutdown.is_triggered() {
            tracing::debug!("Dialing");
            let connected = tokio::select! {
                () = shutdown.wait() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(channel) => {
                    let remote = channel
                        .remote_public_key()
                        .map(|key| hex::encode(key.as_bytes()));
                    tracing::info!(remote = remote.as_deref().unwrap_or("?"), "Connected");
                    // Closes requested from here on are aimed at this channel.
                    let session = self.close.session();
                    self.mark_up(remote);

                    match self.serve(channel, session, shutdown).await {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::ClosedByAuthority) => {
                            tracing::info!("Channel closed after authority transfer");
                            self.mark_down(None);
                        }
                        Err(e) if e.is_fatal() => {
                            tracing::error!(error = %e, "Fatal error while serving");
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, code = e.error_code(), "Connection lost");
                            self.mark_down(Some(&e));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, code = e.error_code(), "Connection attempt failed");
                    self.mark_down(Some(&e));
                }
            }

            tokio::select! {
                () = shutdown.wait() => break,
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }

        tracing::info!("Supervisor stopped");
        Ok(())
    }

    /// Dial and handshake, bounded by the handshake timeout.
    async fn connect(&self) -> KmsResult<Channel> {
        let identity = self.keys.identity_for(self.endpoint.role());
        let attempt = async {
            let stream = self.endpoint.dial().await?;
            let channel = SecretConnection::handshake(stream, identity).await?;
            let remote = channel
                .remote_public_key()
                .ok_or_else(|| KmsError::Handshake("peer did not authenticate".to_string()))?;
            self.endpoint.verify_peer(remote)?;
            Ok(channel)
        };

        tokio::time::timeout(self.handshake_timeout, attempt)
            .await
            .map_err(|_| {
                KmsError::Handshake(format!(
                    "timed out after {}ms",
                    self.handshake_timeout.as_millis()
                ))
            })?
    }

    /// Strict request/response alternation until the channel ends.
    async fn serve(
        &self,
        mut channel: Channel,
        mut session: SessionClose,
        shutdown: &mut Shutdown,
    ) -> KmsResult<SessionEnd> {
        let role = self.endpoint.role();
        loop {
            let payload = tokio::select! {
                () = shutdown.wait() => return Ok(SessionEnd::Shutdown),
                () = session.closed() => return Ok(SessionEnd::ClosedByAuthority),
                read = channel.read_message() => read?,
            };

            let response = self.dispatcher.handle_bytes(role, &payload)?;
            let bytes = response.encode();

            tokio::select! {
                () = shutdown.wait() => return Ok(SessionEnd::Shutdown),
                written = channel.write_message(&bytes) => written?,
            }
        }
    }

    fn mark_up(&self, remote: Option<String>) {
        self.state.send_modify(|state| {
            state.channel_alive = true;
            state.remote = remote;
            state.last_error = None;
            state.retry_backoff = Duration::ZERO;
            state.sessions += 1;
        });
        let _ = self.liveness.send(LivenessEvent::up(self.endpoint.role()));
    }

    fn mark_down(&self, error: Option<&KmsError>) {
        let retry_backoff = self.retry_interval;
        self.state.send_modify(|state| {
            state.channel_alive = false;
            state.remote = None;
            if let Some(e) = error {
                state.last_error = Some(e.to_string());
            }
            state.retry_backoff = retry_backoff;
        });
        let _ = self.liveness.send(LivenessEvent::down(self.endpoint.role()));
    }
}
