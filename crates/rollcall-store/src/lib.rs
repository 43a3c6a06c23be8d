//! rollcall-store — Durable identity store and attendance log.
//!
//! Implements the [`rollcall_core::IdentityStore`] and
//! [`rollcall_core::AttendanceSink`] traits on SQLite.

pub mod sqlite;

pub use sqlite::{OpenError, SqliteStore};
