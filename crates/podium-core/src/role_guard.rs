//! Role guard: who may mutate a student's state.
//!
//! Runs before the conflict policy. The effective role comes from the locally
//! trusted claim only; the envelope's `fromRole` is advisory and is checked
//! merely as a source filter.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::conflict::EnvelopeConflictCursor;
use crate::protocol::{Role, SessionSyncEnvelope, StateUpdateEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleGuardDenyReason {
    NonStudentRuntime,
    UnsupportedEnvelopeKind,
    NonHostEnvelope,
    StaleOrDuplicateEnvelope,
}

impl RoleGuardDenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleGuardDenyReason::NonStudentRuntime => "non-student-runtime",
            RoleGuardDenyReason::UnsupportedEnvelopeKind => "unsupported-envelope-kind",
            RoleGuardDenyReason::NonHostEnvelope => "non-host-envelope",
            RoleGuardDenyReason::StaleOrDuplicateEnvelope => "stale-or-duplicate-envelope",
        }
    }
}

impl fmt::Display for RoleGuardDenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoleGuardOutcome {
    /// The update may be applied; persist `next_cursor` before the next
    /// inbound envelope is evaluated.
    Allow {
        envelope: StateUpdateEnvelope,
        next_cursor: EnvelopeConflictCursor,
    },
    Deny { reason: RoleGuardDenyReason },
}

impl RoleGuardOutcome {
    pub fn is_allow(&self) -> bool {
        matches!(self, RoleGuardOutcome::Allow { .. })
    }

    pub fn deny_reason(&self) -> Option<RoleGuardDenyReason> {
        match self {
            RoleGuardOutcome::Deny { reason } => Some(*reason),
            RoleGuardOutcome::Allow { .. } => None,
        }
    }
}

/// Only an explicit host claim makes this runtime a host.
pub fn effective_role(trusted_role_claim: Option<Role>) -> Role {
    match trusted_role_claim {
        Some(Role::Host) => Role::Host,
        _ => Role::Student,
    }
}

/// Evaluate one inbound envelope. Checks short-circuit in order: runtime role,
/// envelope kind, declared sender role, per-source monotonicity.
pub fn evaluate(
    local_role: Role,
    trusted_role_claim: Option<Role>,
    envelope: SessionSyncEnvelope,
    last_applied: Option<&EnvelopeConflictCursor>,
) -> RoleGuardOutcome {
    let role = effective_role(trusted_role_claim);
    if role != local_role {
        debug!(%local_role, effective = %role, "Local role disagrees with trusted claim");
    }

    if role != Role::Student {
        return deny(RoleGuardDenyReason::NonStudentRuntime);
    }

    let update = match envelope {
        SessionSyncEnvelope::StateUpdate(update) => update,
        SessionSyncEnvelope::StateRequest(_) => {
            return deny(RoleGuardDenyReason::UnsupportedEnvelopeKind);
        }
    };

    if update.from_role() != Role::Host {
        return deny(RoleGuardDenyReason::NonHostEnvelope);
    }

    let monotonic = last_applied
        .is_none_or(|cursor| cursor.source_id != *update.source_id() || update.seq() > cursor.seq);
    if !monotonic {
        return deny(RoleGuardDenyReason::StaleOrDuplicateEnvelope);
    }

    let next_cursor = EnvelopeConflictCursor::from(&update);
    RoleGuardOutcome::Allow {
        envelope: update,
        next_cursor,
    }
}

fn deny(reason: RoleGuardDenyReason) -> RoleGuardOutcome {
    RoleGuardOutcome::Deny { reason }
}
