//! Top-level signer.
//!
//! Wires one [`ConnectionSupervisor`] per endpoint, the shared
//! [`MessageDispatcher`] and the [`SigningAuthority`] together and runs them
//! as independent tasks. A fatal error in any task shuts the others down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::authority::{ActiveSigner, CloseSignal, SigningAuthority};
use crate::config::{PubKeyPolicy, Role, Settings};
use crate::error::{KmsError, KmsResult};
use crate::keystore::KeyRing;
use crate::shutdown::ShutdownHandle;
use crate::signing::MessageDispatcher;
use crate::storage::SigningStateStore;
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::transport::Endpoint;

/// The remote signer process core.
pub struct Signer {
    active: ActiveSigner,
    authority: SigningAuthority,
    supervisors: Vec<ConnectionSupervisor>,
    states: HashMap<Role, watch::Receiver<ConnectionState>>,
}

impl Signer {
    /// Build a signer for the given endpoints, primary first.
    pub fn new(
        endpoints: Vec<Endpoint>,
        keys: KeyRing,
        store: SigningStateStore,
        policy: PubKeyPolicy,
        retry_interval: Duration,
        handshake_timeout: Duration,
    ) -> KmsResult<Self> {
        if endpoints.is_empty() {
            return Err(KmsError::Config("at least one endpoint is required".to_string()));
        }

        let keys = Arc::new(keys);
        let active = ActiveSigner::new(store);
        let dispatcher = MessageDispatcher::new(keys.clone(), active.clone(), policy);
        let (liveness_tx, liveness_rx) = mpsc::unbounded_channel();

        let mut closers = HashMap::new();
        let mut states = HashMap::new();
        let mut supervisors = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let role = endpoint.role();
            if closers.contains_key(&role) {
                return Err(KmsError::Config(format!("duplicate {role} endpoint")));
            }
            let close = CloseSignal::new();
            closers.insert(role, close.clone());

            let supervisor = ConnectionSupervisor::new(
                endpoint,
                keys.clone(),
                dispatcher.clone(),
                liveness_tx.clone(),
                close,
            )
            .with_timing(retry_interval, handshake_timeout);
            states.insert(role, supervisor.state());
            supervisors.push(supervisor);
        }

        let authority = SigningAuthority::new(active.clone(), closers, liveness_rx);

        Ok(Self {
            active,
            authority,
            supervisors,
            states,
        })
    }

    /// Build a signer from validated settings.
    pub fn from_settings(
        settings: &Settings,
        keys: KeyRing,
        store: SigningStateStore,
    ) -> KmsResult<Self> {
        let endpoints = settings.endpoints().map_err(KmsError::Config)?;
        Self::new(
            endpoints,
            keys,
            store,
            settings.pubkey_policy(),
            settings.retry_interval(),
            settings.handshake_timeout(),
        )
    }

    /// Handle to the active role and watermark.
    pub fn active(&self) -> &ActiveSigner {
        &self.active
    }

    /// Watch the connection state of the endpoint holding `role`.
    pub fn connection_state(&self, role: Role) -> Option<watch::Receiver<ConnectionState>> {
        self.states.get(&role).cloned()
    }

    /// Run every task until shutdown.
    ///
    /// Returns the first fatal error after all tasks have stopped.
    pub async fn run(self, shutdown: ShutdownHandle) -> KmsResult<()> {
        tracing::info!(
            endpoints = self.supervisors.len(),
            ha = self.supervisors.len() > 1,
            "Starting signer"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(self.authority.run(shutdown.subscribe()));
        for supervisor in self.supervisors {
            tasks.spawn(supervisor.run(shutdown.subscribe()));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(KmsError::Internal(format!("task failed: {e}"))));
            if let Err(e) = result {
                tracing::error!(error = %e, "Signer task failed, shutting down");
                shutdown.trigger();
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("Signer stopped");
        first_error.map_or(Ok(()), Err)
    }
}
