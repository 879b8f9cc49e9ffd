// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces and implementations of persistence layers for the pelican
//! action pipeline.
//!
//! Server-side state (idempotency ledger, attendance sessions, check-in and
//! acknowledgement records) and the client-side durable outbox are expressed
//! as separate trait interfaces so that every keyed read-modify-write happens
//! behind one injected storage handle rather than in ambient process memory.
//!
//! Two implementations are provided: an in-memory store (`memory` feature,
//! enabled by default) used by tests and demo deployments, and a SQLite store
//! (`sqlite` feature) for production use. The outbox rows in the SQLite store
//! are the durability guarantee of the whole pipeline: an action recorded as
//! taken must survive process death until the server confirms it.
//!
//! Every keyed operation (`reserve`, `close_session`, `insert_or_get_check`,
//! `enqueue`) is a single critical section per key: one write-lock scope in
//! the memory store, a conditional write (`ON CONFLICT`) or transaction in
//! SQLite.
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod traits;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, connection_pool, create_database, run_pending_migrations};
pub use traits::{
    AckStore, CheckInStore, LedgerStore, OutboxStore, Reservation, SessionStore, StoreError,
};
