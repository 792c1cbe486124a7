//! Core types for Podium session sync: the wire envelope and its validation,
//! the conflict policy, the role guard, errors, and configuration.

pub mod config;
pub mod conflict;
pub mod error;
pub mod protocol;
pub mod role_guard;
