//! The session sync orchestrator.
//!
//! A host answers every `state-request` and re-pushes its full state on every
//! local change. A student asks once on start, then folds inbound updates
//! through the role guard and the conflict policy before touching local state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podium_backplane::{RealtimeBackplane, SubscriptionId, TransportKind};
use podium_core::conflict::{ConflictReason, resolve_envelope_conflict};
use podium_core::error::{PodiumError, Result};
use podium_core::protocol::{
    Role, SessionSyncEnvelope, SessionSyncStatePayload, SourceId, create_state_request_envelope,
    create_state_update_envelope, now_ms,
};
use podium_core::role_guard::{self, RoleGuardDenyReason, RoleGuardOutcome};

use crate::store::{IdentityStore, LocalIdentity, RemotePresence, SessionStateStore};

/// What happened to one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Host answered a `state-request`; `delivered` is the publish result.
    Republished { delivered: bool },
    Applied { reason: ConflictReason },
    Ignored { reason: ConflictReason },
    Denied { reason: RoleGuardDenyReason },
}

struct SyncContext {
    backplane: RealtimeBackplane,
    state: Arc<SessionStateStore>,
    identity: Arc<IdentityStore>,
    source_id: SourceId,
    last_seq: AtomicU64,
    observed_role: Mutex<Role>,
    active: AtomicBool,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    subscription: SubscriptionId,
}

pub struct SessionSync {
    ctx: Arc<SyncContext>,
    running: Mutex<Option<Running>>,
}

impl SessionSync {
    pub fn new(
        backplane: RealtimeBackplane,
        state: Arc<SessionStateStore>,
        identity: Arc<IdentityStore>,
    ) -> Self {
        Self::with_source_id(backplane, state, identity, SourceId::generate())
    }

    pub fn with_source_id(
        backplane: RealtimeBackplane,
        state: Arc<SessionStateStore>,
        identity: Arc<IdentityStore>,
        source_id: SourceId,
    ) -> Self {
        let observed = identity.get().effective_role();
        Self {
            ctx: Arc::new(SyncContext {
                backplane,
                state,
                identity,
                source_id,
                last_seq: AtomicU64::new(0),
                observed_role: Mutex::new(observed),
                active: AtomicBool::new(false),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.ctx.source_id
    }

    pub fn state(&self) -> &Arc<SessionStateStore> {
        &self.ctx.state
    }

    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.ctx.identity
    }

    pub fn transport(&self) -> TransportKind {
        self.ctx.backplane.transport()
    }

    /// Highest `seq` this instance has published so far (0 before the first).
    pub fn last_seq(&self) -> u64 {
        self.ctx.last_seq.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect the backplane and begin syncing. Calling it again while running
    /// is a no-op that reports the current transport.
    pub fn start(&self) -> Result<TransportKind> {
        let runtime = Handle::try_current()
            .map_err(|e| PodiumError::Session(format!("session sync needs a Tokio runtime: {e}")))?;

        let mut running = self.lock_running();
        if running.is_some() {
            return Ok(self.ctx.backplane.transport());
        }

        // Subscribe first so a reply to our opening message cannot be missed.
        let subscription = self.ctx.backplane.subscribe();
        let transport = self.ctx.backplane.connect();

        // Picks up role changes made while stopped. Not yet active, so this
        // only updates local state.
        let role = self.ctx.sync_role();
        if role == Role::Host {
            self.ctx.clear_remote_view();
        }
        self.ctx.active.store(true, Ordering::SeqCst);

        let state_rx = self.ctx.state.subscribe();
        let identity_rx = self.ctx.identity.subscribe();

        match role {
            Role::Host => {
                self.ctx.publish_current_state();
            }
            Role::Student => {
                self.ctx.request_state();
            }
        }
        info!(
            source_id = %self.ctx.source_id,
            %role,
            %transport,
            "Session sync started"
        );

        let cancel = CancellationToken::new();
        let task = runtime.spawn(run(
            self.ctx.clone(),
            subscription.receiver,
            state_rx,
            identity_rx,
            cancel.clone(),
        ));
        *running = Some(Running {
            cancel,
            task,
            subscription: subscription.id,
        });
        Ok(transport)
    }

    /// Stop listening and publishing, then release the transport.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return;
        };

        self.ctx.active.store(false, Ordering::SeqCst);
        running.cancel.cancel();
        self.ctx.backplane.unsubscribe(running.subscription);
        if let Err(e) = running.task.await {
            warn!(%e, "Session sync task ended abnormally");
        }
        self.ctx.backplane.close();
        info!(source_id = %self.ctx.source_id, "Session sync stopped");
    }

    /// Replace the local identity and apply any role transition right away.
    pub fn set_identity(&self, identity: LocalIdentity) {
        self.ctx.identity.set(identity);
        self.ctx.sync_role();
    }

    /// Process one validated inbound envelope. The run loop calls this for
    /// every message; it is public so other event loops can drive it.
    pub fn handle_envelope(&self, envelope: SessionSyncEnvelope) -> InboundOutcome {
        self.ctx.handle_envelope(envelope)
    }
}

impl Drop for SessionSync {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.cancel.cancel();
            self.ctx.backplane.unsubscribe(running.subscription);
            self.ctx.backplane.close();
        }
    }
}

impl SyncContext {
    fn lock_observed(&self) -> std::sync::MutexGuard<'_, Role> {
        self.observed_role
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.last_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish_current_state(&self) -> bool {
        let seq = self.next_seq();
        let envelope = create_state_update_envelope(
            &self.source_id,
            Role::Host,
            seq,
            now_ms(),
            self.state.snapshot(),
        );
        let delivered = self.backplane.publish(&envelope);
        debug!(seq, delivered, "Published state");
        delivered
    }

    fn request_state(&self) -> bool {
        let envelope = create_state_request_envelope(&self.source_id, Role::Student, now_ms());
        let delivered = self.backplane.publish(&envelope);
        debug!(delivered, "Requested state");
        delivered
    }

    /// Compare the trusted role with the last one acted on and run the
    /// transition if it moved. Returns the current effective role.
    fn clear_remote_view(&self) {
        self.state.set_last_host_cursor(None);
        self.state.set_remote_presence(None);
    }

    fn sync_role(&self) -> Role {
        let next = self.identity.get().effective_role();
        let previous = std::mem::replace(&mut *self.lock_observed(), next);
        if previous == next {
            return next;
        }

        match next {
            Role::Host => {
                self.clear_remote_view();
                info!("Now hosting; dropped remote cursor and presence");
                if self.active.load(Ordering::SeqCst) {
                    self.publish_current_state();
                }
            }
            Role::Student => {
                info!("Now a student; requesting state");
                if self.active.load(Ordering::SeqCst) {
                    self.request_state();
                }
            }
        }
        next
    }

    fn handle_envelope(&self, envelope: SessionSyncEnvelope) -> InboundOutcome {
        let role = self.sync_role();

        if role == Role::Host {
            if let SessionSyncEnvelope::StateRequest(request) = &envelope {
                debug!(from = %request.source_id(), "State requested");
                let delivered = self.publish_current_state();
                return InboundOutcome::Republished { delivered };
            }
        }

        let identity = self.identity.get();
        let last = self.state.last_host_cursor();
        let (update, next_cursor) = match role_guard::evaluate(
            identity.role,
            identity.trusted_role_claim,
            envelope,
            last.as_ref(),
        ) {
            RoleGuardOutcome::Allow {
                envelope,
                next_cursor,
            } => (envelope, next_cursor),
            RoleGuardOutcome::Deny { reason } => {
                debug!(%reason, "Inbound envelope denied");
                return InboundOutcome::Denied { reason };
            }
        };

        let resolution = resolve_envelope_conflict(last.as_ref(), &next_cursor);
        if !resolution.is_accept() {
            debug!(reason = %resolution.reason, seq = update.seq(), "Inbound update ignored");
            return InboundOutcome::Ignored {
                reason: resolution.reason,
            };
        }

        let payload = update.into_payload();
        let laser_position = payload.laser_position;
        self.state.replace(payload);
        self.state.set_remote_presence(Some(RemotePresence {
            source_id: next_cursor.source_id.clone(),
            seq: next_cursor.seq,
            sent_at: next_cursor.sent_at,
            laser_position,
        }));
        debug!(
            source_id = %next_cursor.source_id,
            seq = next_cursor.seq,
            reason = %resolution.reason,
            "Applied host state"
        );
        self.state.set_last_host_cursor(Some(next_cursor));

        InboundOutcome::Applied {
            reason: resolution.reason,
        }
    }
}

async fn run(
    ctx: Arc<SyncContext>,
    mut inbound: mpsc::UnboundedReceiver<SessionSyncEnvelope>,
    mut state_rx: watch::Receiver<SessionSyncStatePayload>,
    mut identity_rx: watch::Receiver<LocalIdentity>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = inbound.recv() => match envelope {
                Some(envelope) => {
                    ctx.handle_envelope(envelope);
                }
                None => {
                    debug!("Backplane subscription closed");
                    break;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if ctx.sync_role() == Role::Host {
                    ctx.publish_current_state();
                }
            },
            changed = identity_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                ctx.sync_role();
            },
        }
    }
}
