//! Application-facing state and identity stores.
//!
//! Both stores are backed by `tokio::sync::watch` so the orchestrator can
//! react to local changes. Setters only notify when the value actually
//! changed.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use podium_core::conflict::EnvelopeConflictCursor;
use podium_core::protocol::{Point, Role, SessionSyncStatePayload, SharedViewport, SourceId};
use podium_core::role_guard::effective_role;

/// Where the host is, as last seen by a student.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePresence {
    pub source_id: SourceId,
    pub seq: u64,
    pub sent_at: f64,
    pub laser_position: Option<Point>,
}

/// Shared presentation state plus the last applied host cursor.
pub struct SessionStateStore {
    state: watch::Sender<SessionSyncStatePayload>,
    last_host_cursor: Mutex<Option<EnvelopeConflictCursor>>,
    remote_presence: Mutex<Option<RemotePresence>>,
}

impl Default for SessionStateStore {
    fn default() -> Self {
        Self::new(SessionSyncStatePayload::default())
    }
}

impl SessionStateStore {
    pub fn new(initial: SessionSyncStatePayload) -> Self {
        Self {
            state: watch::Sender::new(initial),
            last_host_cursor: Mutex::new(None),
            remote_presence: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> SessionSyncStatePayload {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSyncStatePayload> {
        self.state.subscribe()
    }

    pub fn global_step(&self) -> u64 {
        self.state.borrow().global_step
    }

    pub fn set_global_step(&self, step: u64) -> bool {
        self.modify(|s| set_if_changed(&mut s.global_step, step))
    }

    pub fn shared_viewport(&self) -> SharedViewport {
        self.state.borrow().shared_viewport
    }

    pub fn set_shared_viewport(&self, viewport: SharedViewport) -> bool {
        self.modify(|s| set_if_changed(&mut s.shared_viewport, viewport))
    }

    pub fn laser_position(&self) -> Option<Point> {
        self.state.borrow().laser_position
    }

    pub fn set_laser_position(&self, position: Option<Point>) -> bool {
        self.modify(|s| set_if_changed(&mut s.laser_position, position))
    }

    /// Replace the whole state at once, e.g. with a host payload.
    pub fn replace(&self, next: SessionSyncStatePayload) -> bool {
        self.modify(|s| set_if_changed(s, next))
    }

    /// Apply several edits as one change notification.
    pub fn update(&self, edit: impl FnOnce(&mut SessionSyncStatePayload)) -> bool {
        self.modify(|s| {
            let before = s.clone();
            edit(s);
            *s != before
        })
    }

    fn modify(&self, edit: impl FnOnce(&mut SessionSyncStatePayload) -> bool) -> bool {
        self.state.send_if_modified(edit)
    }

    pub fn last_host_cursor(&self) -> Option<EnvelopeConflictCursor> {
        self.last_host_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_last_host_cursor(&self, cursor: Option<EnvelopeConflictCursor>) {
        *self
            .last_host_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cursor;
    }

    pub fn remote_presence(&self) -> Option<RemotePresence> {
        self.remote_presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_remote_presence(&self, presence: Option<RemotePresence>) {
        *self
            .remote_presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = presence;
    }
}

fn set_if_changed<T: PartialEq>(slot: &mut T, next: T) -> bool {
    if *slot == next {
        false
    } else {
        *slot = next;
        true
    }
}

/// Who this client is. `role` is what the UI shows; `trusted_role_claim` is
/// maintained separately and is the only thing that grants host authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    pub role: Role,
    pub trusted_role_claim: Option<Role>,
}

impl LocalIdentity {
    pub fn host() -> Self {
        Self {
            role: Role::Host,
            trusted_role_claim: Some(Role::Host),
        }
    }

    pub fn student() -> Self {
        Self {
            role: Role::Student,
            trusted_role_claim: Some(Role::Student),
        }
    }

    pub fn effective_role(&self) -> Role {
        effective_role(self.trusted_role_claim)
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self {
            role: Role::Student,
            trusted_role_claim: None,
        }
    }
}

pub struct IdentityStore {
    identity: watch::Sender<LocalIdentity>,
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new(LocalIdentity::default())
    }
}

impl IdentityStore {
    pub fn new(initial: LocalIdentity) -> Self {
        Self {
            identity: watch::Sender::new(initial),
        }
    }

    pub fn get(&self) -> LocalIdentity {
        *self.identity.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LocalIdentity> {
        self.identity.subscribe()
    }

    pub fn set(&self, identity: LocalIdentity) -> bool {
        self.identity
            .send_if_modified(|current| set_if_changed(current, identity))
    }

    pub fn set_role(&self, role: Role) -> bool {
        self.identity
            .send_if_modified(|current| set_if_changed(&mut current.role, role))
    }

    pub fn set_trusted_role_claim(&self, claim: Option<Role>) -> bool {
        self.identity
            .send_if_modified(|current| set_if_changed(&mut current.trusted_role_claim, claim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setters_only_notify_on_change() {
        let store = SessionStateStore::default();
        let mut rx = store.subscribe();

        assert!(!store.set_global_step(0));
        assert!(!rx.has_changed().unwrap());

        assert!(store.set_global_step(3));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert_eq!(store.global_step(), 3);

        assert!(store.set_laser_position(Some(Point::new(0.5, 0.5))));
        assert!(!store.set_laser_position(Some(Point::new(0.5, 0.5))));
        assert!(store.set_laser_position(None));
    }

    #[test]
    fn test_update_batches_edits() {
        let store = SessionStateStore::default();
        let changed = store.update(|s| {
            s.global_step = 9;
            s.shared_viewport.zoom_level = 2.0;
        });
        assert!(changed);
        assert_eq!(store.global_step(), 9);
        assert_eq!(store.shared_viewport().zoom_level, 2.0);
        assert!(!store.update(|s| s.global_step = 9));
    }

    #[test]
    fn test_cursor_and_presence_slots() {
        let store = SessionStateStore::default();
        assert!(store.last_host_cursor().is_none());

        let cursor = EnvelopeConflictCursor::new(SourceId::new("h").unwrap(), 2, 10.0);
        store.set_last_host_cursor(Some(cursor.clone()));
        assert_eq!(store.last_host_cursor(), Some(cursor));

        store.set_remote_presence(Some(RemotePresence {
            source_id: SourceId::new("h").unwrap(),
            seq: 2,
            sent_at: 10.0,
            laser_position: None,
        }));
        assert!(store.remote_presence().is_some());
        store.set_remote_presence(None);
        assert!(store.remote_presence().is_none());
    }

    #[test]
    fn test_identity_effective_role() {
        assert_eq!(LocalIdentity::host().effective_role(), Role::Host);
        assert_eq!(LocalIdentity::student().effective_role(), Role::Student);

        let spoofed = LocalIdentity {
            role: Role::Host,
            trusted_role_claim: None,
        };
        assert_eq!(spoofed.effective_role(), Role::Student);

        let store = IdentityStore::default();
        assert!(store.set_role(Role::Host));
        assert_eq!(store.get().effective_role(), Role::Student);
        assert!(store.set_trusted_role_claim(Some(Role::Host)));
        assert_eq!(store.get().effective_role(), Role::Host);
        assert!(!store.set(LocalIdentity::host()));
    }
}
