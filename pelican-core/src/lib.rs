// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core data types for the pelican offline action pipeline.
//!
//! A user action is written to a durable outbox before any network delivery is
//! attempted, identified by a client-generated [`IdempotencyKey`]. The server
//! records the first successful application of every key in an idempotency
//! ledger ([`IdempotencyRecord`]) so that retried deliveries take effect at
//! most once. Attendance check-ins are reconciled against a time-bounded
//! [`AttendanceSession`] whose displayed code rotates client-side only.
//!
//! This crate is free of I/O and async code; persistence interfaces live in
//! `pelican-store`, the HTTP surface in `pelican-server` and the device-side
//! pipeline in `pelican-client`.
mod code;
mod input;
mod key;
mod ledger;
mod outbox;
mod session;
mod time;

pub use code::ErrorCode;
pub use input::{InputError, parse_session_input};
pub use key::{ID_LEN, IdempotencyKey, KeyError, SessionId};
pub use ledger::IdempotencyRecord;
pub use outbox::{ActionKind, NewOutboxItem, OutboxItem, UnknownActionKind};
pub use session::{
    AttendanceCheckRecord, AttendanceSession, SessionStatus, SessionTransitionError,
    SessionValidity, UnknownSessionStatus,
};
pub use time::now_unix;
