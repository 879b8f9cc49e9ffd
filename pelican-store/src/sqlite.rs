// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistent storage.
//!
//! Keyed invariants (one ledger row per idempotency key, one check-in per
//! `(session_id, owner_id)`, one outbox row per key) are enforced by unique
//! indexes; the store classifies replay vs. conflict by re-reading the row
//! that won the conditional insert. Session lifecycle transitions run inside
//! a transaction so the read-modify-write is atomic.
use std::str::FromStr;

use sqlx::migrate;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, query};

use pelican_core::{
    ActionKind, AttendanceCheckRecord, AttendanceSession, IdempotencyKey, IdempotencyRecord,
    NewOutboxItem, OutboxItem, SessionId, SessionStatus,
};

use crate::traits::{
    AckStore, CheckInStore, LedgerStore, OutboxStore, Reservation, SessionStore, StoreError,
};

/// Re-export of SQLite connection pool type.
pub type Pool = SqlitePool;

/// SQLite-based persistent store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    /// Create a new `SqliteStore` using the provided db `Pool`.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Create the database if it doesn't already exist.
pub async fn create_database(url: &str) -> Result<(), StoreError> {
    if !Sqlite::database_exists(url).await? {
        Sqlite::create_database(url).await?;
    }

    Ok(())
}

/// Create a connection pool.
pub async fn connection_pool(url: &str, max_connections: u32) -> Result<Pool, StoreError> {
    let pool: Pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    Ok(pool)
}

/// Run any pending database migrations from inside the application.
pub async fn run_pending_migrations(pool: &Pool) -> Result<(), StoreError> {
    migrate!()
        .run(pool)
        .await
        .map_err(|err| StoreError::Backend(err.to_string()))?;
    Ok(())
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("corrupt row: {err}"))
}

fn record_from_row(row: &SqliteRow) -> Result<IdempotencyRecord, StoreError> {
    let result: Option<String> = row.try_get("result")?;
    Ok(IdempotencyRecord {
        key: IdempotencyKey::from_str(row.try_get("key")?).map_err(corrupt)?,
        owner_id: row.try_get("owner_id")?,
        target_id: row.try_get("target_id")?,
        result: result
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(corrupt)?,
        created_at: row.try_get::<i64, _>("created_at")? as u64,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<AttendanceSession, StoreError> {
    Ok(AttendanceSession {
        id: SessionId::from_str(row.try_get("id")?).map_err(corrupt)?,
        course_id: row.try_get("course_id")?,
        policy_id: row.try_get("policy_id")?,
        open_at: row.try_get::<i64, _>("open_at")? as u64,
        close_at: row.try_get::<i64, _>("close_at")? as u64,
        seed: row.try_get("seed")?,
        status: SessionStatus::from_str(row.try_get("status")?).map_err(corrupt)?,
    })
}

fn check_from_row(row: &SqliteRow) -> Result<AttendanceCheckRecord, StoreError> {
    Ok(AttendanceCheckRecord {
        id: row.try_get::<i64, _>("id")? as u64,
        session_id: SessionId::from_str(row.try_get("session_id")?).map_err(corrupt)?,
        owner_id: row.try_get("owner_id")?,
        ts: row.try_get::<i64, _>("ts")? as u64,
        idempotency_key: IdempotencyKey::from_str(row.try_get("idempotency_key")?)
            .map_err(corrupt)?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<OutboxItem, StoreError> {
    Ok(OutboxItem {
        id: row.try_get::<i64, _>("id")? as u64,
        kind: ActionKind::from_str(row.try_get("kind")?).map_err(corrupt)?,
        payload: serde_json::from_str(row.try_get("payload")?).map_err(corrupt)?,
        idempotency_key: IdempotencyKey::from_str(row.try_get("idempotency_key")?)
            .map_err(corrupt)?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get::<i64, _>("created_at")? as u64,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
    })
}

impl LedgerStore for SqliteStore {
    async fn reserve(
        &self,
        key: IdempotencyKey,
        owner_id: &str,
        target_id: &str,
        created_at: u64,
    ) -> Result<Reservation, StoreError> {
        // The unique primary key on `key` makes this insert the atomic
        // check-and-set; losing the race simply means reading the winner.
        let inserted = query(
            "
            INSERT INTO
                idempotency_ledger_v1 (key, owner_id, target_id, result, created_at)
            VALUES
                ($1, $2, $3, NULL, $4)
            ON CONFLICT (key) DO NOTHING
            ",
        )
        .bind(key.to_hex())
        .bind(owner_id)
        .bind(target_id)
        .bind(created_at as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(Reservation::New);
        }

        let row = query("SELECT * FROM idempotency_ledger_v1 WHERE key = $1")
            .bind(key.to_hex())
            .fetch_one(&self.pool)
            .await?;
        let record = record_from_row(&row)?;

        if record.matches(owner_id, target_id) {
            Ok(Reservation::Replay(record))
        } else {
            Err(StoreError::IdempotencyConflict(key))
        }
    }

    async fn attach_result(
        &self,
        key: IdempotencyKey,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        // First write wins; completed records stay immutable.
        query("UPDATE idempotency_ledger_v1 SET result = $1 WHERE key = $2 AND result IS NULL")
            .bind(result.to_string())
            .bind(key.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_record(
        &self,
        key: IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = query("SELECT * FROM idempotency_ledger_v1 WHERE key = $1")
            .bind(key.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

impl SessionStore for SqliteStore {
    async fn insert_session(&self, session: AttendanceSession) -> Result<(), StoreError> {
        query(
            "
            INSERT INTO
                attendance_sessions_v1 (id, course_id, policy_id, open_at, close_at, seed, status)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(session.id.to_hex())
        .bind(&session.course_id)
        .bind(&session.policy_id)
        .bind(session.open_at as i64)
        .bind(session.close_at as i64)
        .bind(&session.seed)
        .bind(session.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<AttendanceSession>, StoreError> {
        let row = query("SELECT * FROM attendance_sessions_v1 WHERE id = $1")
            .bind(id.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn close_session(&self, id: SessionId) -> Result<AttendanceSession, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = query("SELECT * FROM attendance_sessions_v1 WHERE id = $1")
            .bind(id.to_hex())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::SessionNotFound(id))?;
        let mut session = session_from_row(&row)?;

        if session.close() {
            query("UPDATE attendance_sessions_v1 SET status = $1 WHERE id = $2")
                .bind(session.status.as_str())
                .bind(id.to_hex())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(session)
    }

    async fn extend_session(
        &self,
        id: SessionId,
        close_at: u64,
    ) -> Result<AttendanceSession, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = query("SELECT * FROM attendance_sessions_v1 WHERE id = $1")
            .bind(id.to_hex())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::SessionNotFound(id))?;
        let mut session = session_from_row(&row)?;

        session.extend(close_at)?;

        query("UPDATE attendance_sessions_v1 SET close_at = $1 WHERE id = $2")
            .bind(close_at as i64)
            .bind(id.to_hex())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(session)
    }
}

impl CheckInStore for SqliteStore {
    async fn insert_or_get_check(
        &self,
        session_id: SessionId,
        owner_id: &str,
        ts: u64,
        idempotency_key: IdempotencyKey,
    ) -> Result<(bool, AttendanceCheckRecord), StoreError> {
        let inserted = query(
            "
            INSERT INTO
                attendance_checks_v1 (session_id, owner_id, ts, idempotency_key)
            VALUES
                ($1, $2, $3, $4)
            ON CONFLICT (session_id, owner_id) DO NOTHING
            ",
        )
        .bind(session_id.to_hex())
        .bind(owner_id)
        .bind(ts as i64)
        .bind(idempotency_key.to_hex())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let row = query("SELECT * FROM attendance_checks_v1 WHERE session_id = $1 AND owner_id = $2")
            .bind(session_id.to_hex())
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

        Ok((inserted == 1, check_from_row(&row)?))
    }

    async fn checks_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<AttendanceCheckRecord>, StoreError> {
        let rows = query("SELECT * FROM attendance_checks_v1 WHERE session_id = $1 ORDER BY id")
            .bind(session_id.to_hex())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(check_from_row).collect()
    }
}

impl AckStore for SqliteStore {
    async fn insert_ack(&self, broadcast_id: &str, owner_id: &str) -> Result<bool, StoreError> {
        let inserted = query(
            "
            INSERT INTO
                broadcast_acks_v1 (broadcast_id, owner_id)
            VALUES
                ($1, $2)
            ON CONFLICT (broadcast_id, owner_id) DO NOTHING
            ",
        )
        .bind(broadcast_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn ack_count(&self, broadcast_id: &str) -> Result<u64, StoreError> {
        let row = query("SELECT COUNT(*) AS count FROM broadcast_acks_v1 WHERE broadcast_id = $1")
            .bind(broadcast_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("count")? as u64)
    }
}

impl OutboxStore for SqliteStore {
    async fn enqueue(&self, new: NewOutboxItem) -> Result<Option<OutboxItem>, StoreError> {
        let result = query(
            "
            INSERT INTO
                outbox_items_v1 (kind, payload, idempotency_key, owner_id, created_at)
            VALUES
                ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            ",
        )
        .bind(new.kind.as_str())
        .bind(new.payload.to_string())
        .bind(new.idempotency_key.to_hex())
        .bind(&new.owner_id)
        .bind(new.created_at as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(OutboxItem::from_new(
            result.last_insert_rowid() as u64,
            new,
        )))
    }

    async fn pending(&self, owner_id: &str) -> Result<Vec<OutboxItem>, StoreError> {
        let rows =
            query("SELECT * FROM outbox_items_v1 WHERE owner_id = $1 ORDER BY created_at, id")
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn mark_attempt(&self, id: u64, error: &str) -> Result<(), StoreError> {
        query("UPDATE outbox_items_v1 SET attempts = attempts + 1, last_error = $1 WHERE id = $2")
            .bind(error)
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: u64, owner_id: &str) -> Result<bool, StoreError> {
        let removed = query("DELETE FROM outbox_items_v1 WHERE id = $1 AND owner_id = $2")
            .bind(id as i64)
            .bind(owner_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use pelican_core::{
        ActionKind, AttendanceSession, IdempotencyKey, NewOutboxItem, SessionId, SessionStatus,
    };

    use crate::traits::{
        AckStore, CheckInStore, LedgerStore, OutboxStore, Reservation, SessionStore, StoreError,
    };

    use super::{SqliteStore, connection_pool, run_pending_migrations};

    async fn store() -> SqliteStore {
        // A single connection keeps the in-memory database alive for the
        // whole test.
        let pool = connection_pool("sqlite::memory:", 1).await.unwrap();
        run_pending_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn new_item(owner_id: &str, created_at: u64) -> NewOutboxItem {
        NewOutboxItem {
            kind: ActionKind::AttendanceCheck,
            payload: serde_json::json!({ "uid": owner_id, "ts": created_at }),
            idempotency_key: IdempotencyKey::new(),
            owner_id: owner_id.to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn reserve_replay_and_conflict() {
        let store = store().await;
        let key = IdempotencyKey::new();

        assert_eq!(
            store.reserve(key, "u1", "b1", 10).await.unwrap(),
            Reservation::New
        );

        store
            .attach_result(key, serde_json::json!({ "status": "ok" }))
            .await
            .unwrap();
        store
            .attach_result(key, serde_json::json!({ "status": "late" }))
            .await
            .unwrap();

        match store.reserve(key, "u1", "b1", 11).await.unwrap() {
            Reservation::Replay(record) => {
                assert_eq!(record.result, Some(serde_json::json!({ "status": "ok" })));
            }
            Reservation::New => panic!("expected replay"),
        }

        assert!(matches!(
            store.reserve(key, "u1", "b2", 12).await,
            Err(StoreError::IdempotencyConflict(_))
        ));
    }

    #[tokio::test]
    async fn session_round_trip_and_close() {
        let store = store().await;
        let session = AttendanceSession {
            id: SessionId::new(),
            course_id: "c1".to_string(),
            policy_id: "p1".to_string(),
            open_at: 100,
            close_at: 200,
            seed: "seed".to_string(),
            status: SessionStatus::Open,
        };
        store.insert_session(session.clone()).await.unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        let extended = store.extend_session(session.id, 300).await.unwrap();
        assert_eq!(extended.close_at, 300);

        let closed = store.close_session(session.id).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        let again = store.close_session(session.id).await.unwrap();
        assert_eq!(again, closed);

        assert!(store.extend_session(session.id, 400).await.is_err());
        assert!(matches!(
            store.close_session(SessionId::new()).await,
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn check_in_dedup() {
        let store = store().await;
        let session_id = SessionId::new();

        let (inserted, first) = store
            .insert_or_get_check(session_id, "u1", 5, IdempotencyKey::new())
            .await
            .unwrap();
        assert!(inserted);

        let (inserted, second) = store
            .insert_or_get_check(session_id, "u1", 6, IdempotencyKey::new())
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(first, second);

        assert_eq!(store.checks_for_session(session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn acks_are_a_set() {
        let store = store().await;
        assert!(store.insert_ack("b1", "u1").await.unwrap());
        assert!(!store.insert_ack("b1", "u1").await.unwrap());
        assert_eq!(store.ack_count("b1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn outbox_survives_via_rows() {
        let store = store().await;
        let new = new_item("u1", 7);

        let item = store.enqueue(new.clone()).await.unwrap().unwrap();
        assert!(store.enqueue(new).await.unwrap().is_none());

        store.mark_attempt(item.id, "timed out").await.unwrap();
        let pending = store.pending("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("timed out"));

        assert!(!store.remove(item.id, "someone-else").await.unwrap());
        assert!(store.remove(item.id, "u1").await.unwrap());
        assert!(store.pending("u1").await.unwrap().is_empty());
    }
}
