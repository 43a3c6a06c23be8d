//! Collaborator interfaces for identity storage and attendance recording.

use thiserror::Error;

use crate::types::{AttendanceEvent, Descriptor, Identity};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("identity already exists: {0}")]
    AlreadyExists(String),
    #[error("corrupt record for {handle}: {reason}")]
    Corrupt { handle: String, reason: String },
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Owner of enrolled identities.
///
/// Implementations must make `set_descriptor` atomic per identity and return
/// `list_with_descriptor` in insertion order.
pub trait IdentityStore: Send + Sync {
    fn find_by_handle(&self, handle: &str) -> Result<Identity, StoreError>;

    /// Owned snapshot of every identity that currently holds a descriptor.
    fn list_with_descriptor(&self) -> Result<Vec<Identity>, StoreError>;

    /// Replace the descriptor for `handle`. Fails with `NotFound` for an
    /// unknown handle.
    fn set_descriptor(&self, handle: &str, descriptor: &Descriptor) -> Result<(), StoreError>;
}

/// Append-only destination for attendance events.
pub trait AttendanceSink: Send + Sync {
    fn append(&self, event: &AttendanceEvent) -> Result<(), StoreError>;
}
