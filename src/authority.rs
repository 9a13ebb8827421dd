//! Signing authority.
//!
//! [`ActiveSigner`] is the single source of truth for which endpoint role
//! may obtain signatures. The active role and the watermark store live behind
//! one mutex so that "is this role active, is the request above the
//! watermark, sign, persist" runs as one critical section. Two roles can
//! never be active at once because there is only one `current_role` field.
//!
//! [`SigningAuthority`] is the task that moves authority between roles. It
//! consumes liveness events from the connection supervisors and fails over
//! when the active endpoint is down and the other one is up. Failover is
//! sticky: a recovered endpoint does not take authority back until the
//! currently active one fails in turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};

use crate::config::Role;
use crate::error::{KmsError, KmsResult};
use crate::shutdown::Shutdown;
use crate::signing::types::SigningState;
use crate::storage::SigningStateStore;

// =============================================================================
// Active Signer
// =============================================================================

struct Core {
    current_role: Role,
    store: SigningStateStore,
}

/// Shared handle to the active role and the watermark.
///
/// Clone is cheap.
#[derive(Clone)]
pub struct ActiveSigner {
    core: Arc<Mutex<Core>>,
}

impl ActiveSigner {
    /// Primary holds authority at startup.
    pub fn new(store: SigningStateStore) -> Self {
        Self::with_role(store, Role::Primary)
    }

    pub fn with_role(store: SigningStateStore, current_role: Role) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core {
                current_role,
                store,
            })),
        }
    }

    /// A poisoned lock is fatal: a sign operation panicked while holding it.
    fn lock(&self) -> KmsResult<MutexGuard<'_, Core>> {
        self.core.lock().map_err(|_| {
            tracing::error!("Signer state lock poisoned");
            KmsError::StatePoisoned
        })
    }

    pub fn current_role(&self) -> KmsResult<Role> {
        Ok(self.lock()?.current_role)
    }

    pub fn is_active(&self, role: Role) -> KmsResult<bool> {
        Ok(self.current_role()? == role)
    }

    /// Snapshot of the persisted watermark.
    pub fn watermark(&self) -> KmsResult<SigningState> {
        Ok(self.lock()?.store.read())
    }

    /// Run `f` against the store while holding authority for `role`.
    ///
    /// The lock is held for the whole call, so no handover and no other
    /// signing request can interleave. `f` must not perform network I/O.
    pub fn with_authority<T>(
        &self,
        role: Role,
        f: impl FnOnce(&mut SigningStateStore) -> KmsResult<T>,
    ) -> KmsResult<T> {
        let mut core = self.lock()?;
        if core.current_role != role {
            return Err(KmsError::NotActive(role));
        }
        f(&mut core.store)
    }

    /// Move authority from `from` to `to`.
    ///
    /// Returns false, changing nothing, when `from` is no longer the active
    /// role.
    pub fn hand_over(&self, from: Role, to: Role) -> KmsResult<bool> {
        let mut core = self.lock()?;
        if core.current_role != from || from == to {
            return Ok(false);
        }
        core.current_role = to;
        Ok(true)
    }
}

impl std::fmt::Debug for ActiveSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = self.current_role().ok();
        f.debug_struct("ActiveSigner")
            .field("current_role", &role)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Close Signal
// =============================================================================

/// Request that a supervisor drop its current channel.
///
/// Each request bumps a generation counter. A session subscribes when it
/// starts and sees every request made after that point, including one made
/// while it is busy reading or writing. Requests made before the session
/// started are ignored.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Start watching for requests on behalf of one session.
    pub fn session(&self) -> SessionClose {
        SessionClose {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Close requests seen by a single session.
#[derive(Debug)]
pub struct SessionClose {
    rx: watch::Receiver<u64>,
}

impl SessionClose {
    /// Resolves once a close has been requested since the session started.
    /// Cancel safe.
    pub async fn closed(&mut self) {
        if self.rx.changed().await.is_err() {
            // Every signal handle is gone; nobody can ask us to close.
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// Liveness
// =============================================================================

/// Link status reported by a connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Handshake completed; the channel is serving.
    Up,
    /// Dial, handshake or channel failed.
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessEvent {
    pub role: Role,
    pub liveness: Liveness,
}

impl LivenessEvent {
    pub fn up(role: Role) -> Self {
        Self {
            role,
            liveness: Liveness::Up,
        }
    }

    pub fn down(role: Role) -> Self {
        Self {
            role,
            liveness: Liveness::Down,
        }
    }
}

/// Last known status of an endpoint link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Unknown,
    Up,
    Down,
}

/// A completed authority handover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Role,
    pub to: Role,
}

// =============================================================================
// Signing Authority
// =============================================================================

/// Failover state machine driven by liveness events.
pub struct SigningAuthority {
    active: ActiveSigner,
    links: HashMap<Role, LinkState>,
    closers: HashMap<Role, CloseSignal>,
    events: mpsc::UnboundedReceiver<LivenessEvent>,
}

impl SigningAuthority {
    /// `closers` holds, per role, the signal that makes that role's
    /// supervisor drop its current channel.
    pub fn new(
        active: ActiveSigner,
        closers: HashMap<Role, CloseSignal>,
        events: mpsc::UnboundedReceiver<LivenessEvent>,
    ) -> Self {
        let links = [Role::Primary, Role::Standby]
            .into_iter()
            .map(|role| (role, LinkState::Unknown))
            .collect();
        Self {
            active,
            links,
            closers,
            events,
        }
    }

    fn link(&self, role: Role) -> LinkState {
        self.links.get(&role).copied().unwrap_or(LinkState::Unknown)
    }

    /// Apply one liveness event and fail over if warranted.
    pub fn on_event(&mut self, event: LivenessEvent) -> KmsResult<Option<Transition>> {
        let state = match event.liveness {
            Liveness::Up => LinkState::Up,
            Liveness::Down => LinkState::Down,
        };
        let previous = self.links.insert(event.role, state);

        let current = self.active.current_role()?;
        let other = current.other();

        if self.link(current) != LinkState::Down {
            return Ok(None);
        }

        if self.link(other) != LinkState::Up {
            // Only report the loss once, not on every failed redial.
            if event.role == current && previous != Some(LinkState::Down) {
                tracing::warn!(
                    role = %current,
                    standby = %other,
                    "Active endpoint lost and no other endpoint is up; keeping authority"
                );
            }
            return Ok(None);
        }

        if !self.active.hand_over(current, other)? {
            return Ok(None);
        }

        // Drop whatever channel the former role holds so it redials clean.
        if let Some(closer) = self.closers.get(&current) {
            closer.request();
        }

        tracing::warn!(
            from = %current,
            to = %other,
            "Signing authority transferred"
        );
        Ok(Some(Transition {
            from: current,
            to: other,
        }))
    }

    /// Process events until shutdown or until every supervisor is gone.
    pub async fn run(mut self, mut shutdown: Shutdown) -> KmsResult<()> {
        tracing::info!(
            role = %self.active.current_role()?,
            "Signing authority started"
        );

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                event = self.events.recv() => match event {
                    Some(event) => {
                        tracing::debug!(role = %event.role, liveness = ?event.liveness, "Liveness event");
                        self.on_event(event)?;
                    }
                    None => break,
                },
            }
        }

        tracing::info!("Signing authority stopped");
        Ok(())
    }
}
