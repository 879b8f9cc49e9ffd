// SPDX-License-Identifier: MIT OR Apache-2.0

use pelican_core::{
    AttendanceCheckRecord, AttendanceSession, IdempotencyKey, IdempotencyRecord, NewOutboxItem,
    OutboxItem, SessionId, SessionTransitionError,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The idempotency key was already reserved for a different
    /// `(owner_id, target_id)` pair.
    #[error("idempotency key {0} already used for a different target")]
    IdempotencyConflict(IdempotencyKey),

    /// No attendance session exists under the given id.
    #[error("no attendance session with id {0}")]
    SessionNotFound(SessionId),

    /// An invalid session lifecycle transition was requested.
    #[error(transparent)]
    SessionTransition(#[from] SessionTransitionError),

    /// The storage backend failed; the operation may be retried.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Outcome of reserving an idempotency key.
#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    /// The key was unseen and is now reserved; the caller must apply the side
    /// effect and attach its result.
    New,
    /// The key was already applied by a request with the same identity; the
    /// stored record is returned instead of re-applying the effect.
    Replay(IdempotencyRecord),
}

/// Server-side ledger mapping idempotency keys to the result of their first
/// successful application.
pub trait LedgerStore {
    /// Atomically reserve a key for the given `(owner_id, target_id)`
    /// identity.
    ///
    /// Returns [`Reservation::New`] for an unseen key,
    /// [`Reservation::Replay`] when the key was seen with a matching
    /// identity, and [`StoreError::IdempotencyConflict`] when the key was
    /// seen with a different identity. The check-and-set is a single
    /// critical section per key.
    fn reserve(
        &self,
        key: IdempotencyKey,
        owner_id: &str,
        target_id: &str,
        created_at: u64,
    ) -> impl Future<Output = Result<Reservation, StoreError>> + Send;

    /// Attach the result payload of the first successful application.
    ///
    /// The first write wins; later writes for the same key are no-ops, which
    /// keeps records immutable once completed.
    fn attach_result(
        &self,
        key: IdempotencyKey,
        result: serde_json::Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Get the record for a key.
    fn get_record(
        &self,
        key: IdempotencyKey,
    ) -> impl Future<Output = Result<Option<IdempotencyRecord>, StoreError>> + Send;
}

/// Server-side store of attendance sessions and their lifecycle.
pub trait SessionStore {
    /// Insert a newly created session.
    fn insert_session(
        &self,
        session: AttendanceSession,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Get a session by id.
    fn get_session(
        &self,
        id: SessionId,
    ) -> impl Future<Output = Result<Option<AttendanceSession>, StoreError>> + Send;

    /// Close a session.
    ///
    /// Idempotent: closing an already-closed session returns the terminal
    /// record unchanged. The `Open -> Closed` transition happens inside the
    /// store's critical section for the session id.
    fn close_session(
        &self,
        id: SessionId,
    ) -> impl Future<Output = Result<AttendanceSession, StoreError>> + Send;

    /// Move a session's close time forward; permitted only while open.
    fn extend_session(
        &self,
        id: SessionId,
        close_at: u64,
    ) -> impl Future<Output = Result<AttendanceSession, StoreError>> + Send;
}

/// Server-side store of accepted attendance check-ins.
pub trait CheckInStore {
    /// Record a check-in, or return the existing record for the same
    /// `(session_id, owner_id)` pair.
    ///
    /// Returns `true` when the insert occurred, or `false` when the check-in
    /// already existed and the original record is returned instead.
    fn insert_or_get_check(
        &self,
        session_id: SessionId,
        owner_id: &str,
        ts: u64,
        idempotency_key: IdempotencyKey,
    ) -> impl Future<Output = Result<(bool, AttendanceCheckRecord), StoreError>> + Send;

    /// All check-ins recorded for a session, in insertion order.
    fn checks_for_session(
        &self,
        session_id: SessionId,
    ) -> impl Future<Output = Result<Vec<AttendanceCheckRecord>, StoreError>> + Send;
}

/// Server-side store of broadcast acknowledgements.
pub trait AckStore {
    /// Record that a user acknowledged a broadcast.
    ///
    /// Set semantics: returns `true` when the ack was new and `false` when
    /// it was already present, so retries never double-count.
    fn insert_ack(
        &self,
        broadcast_id: &str,
        owner_id: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Number of distinct users who acknowledged a broadcast.
    fn ack_count(&self, broadcast_id: &str)
    -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Client-side durable queue of not-yet-confirmed actions.
pub trait OutboxStore {
    /// Append a new item to the queue.
    ///
    /// Returns `None` when an item with the same idempotency key already
    /// exists, in which case nothing is written.
    fn enqueue(
        &self,
        new: NewOutboxItem,
    ) -> impl Future<Output = Result<Option<OutboxItem>, StoreError>> + Send;

    /// All pending items for an owner, ordered by creation time then id.
    fn pending(
        &self,
        owner_id: &str,
    ) -> impl Future<Output = Result<Vec<OutboxItem>, StoreError>> + Send;

    /// Record a failed delivery attempt against an item.
    fn mark_attempt(
        &self,
        id: u64,
        error: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove an item after confirmed delivery or a terminal response.
    ///
    /// Returns `true` when the removal occurred and `false` when no such
    /// item was queued for the owner.
    fn remove(&self, id: u64, owner_id: &str)
    -> impl Future<Output = Result<bool, StoreError>> + Send;
}
