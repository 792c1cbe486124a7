//! Session sync: mirror one host's step, viewport, and laser pointer onto
//! every student.
//!
//! [`SessionSync`] composes the backplane, the role guard, and the conflict
//! policy against the application's [`SessionStateStore`] and
//! [`IdentityStore`]. `start()` and `stop()` are the only entry points.

pub mod store;
pub mod sync;

pub use store::{IdentityStore, LocalIdentity, RemotePresence, SessionStateStore};
pub use sync::{InboundOutcome, SessionSync};
