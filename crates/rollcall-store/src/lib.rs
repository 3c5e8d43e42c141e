//! rollcall-store — Persistent storage for the attendance engine.
//!
//! Implements the `IdentityStore` and `RecordStore` interfaces of
//! `rollcall-core` on top of a single SQLite database file.

pub mod codec;
pub mod sqlite;

pub use sqlite::{SqliteStore, SqliteStoreError, StoreCounts};
