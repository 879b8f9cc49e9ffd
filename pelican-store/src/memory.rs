// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory persistence for pelican server and client state.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use pelican_core::{
    AttendanceCheckRecord, AttendanceSession, IdempotencyKey, IdempotencyRecord, NewOutboxItem,
    OutboxItem, SessionId,
};

use crate::traits::{
    AckStore, CheckInStore, LedgerStore, OutboxStore, Reservation, SessionStore, StoreError,
};

/// Inner state behind the store lock.
#[derive(Debug, Default)]
pub struct InnerMemoryStore {
    ledger: HashMap<IdempotencyKey, IdempotencyRecord>,
    sessions: HashMap<SessionId, AttendanceSession>,
    checks: HashMap<(SessionId, String), AttendanceCheckRecord>,
    next_check_id: u64,
    acks: HashMap<String, HashSet<String>>,
    outbox: BTreeMap<u64, OutboxItem>,
    outbox_keys: HashSet<IdempotencyKey>,
    next_item_id: u64,
}

/// An in-memory store implementing every pelican persistence interface.
///
/// `MemoryStore` supports usage in asynchronous and multi-threaded contexts
/// by wrapping an [`InnerMemoryStore`] with an `RwLock` and `Arc`. Cloning
/// the store clones the handle, not the state, so a clone observes the same
/// pending set; tests use this to model a process restart over surviving
/// storage. Each write-guard scope is the per-key critical section the keyed
/// operations require.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<InnerMemoryStore>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a read-lock on the store.
    fn read_store(&self) -> RwLockReadGuard<'_, InnerMemoryStore> {
        self.inner
            .read()
            .expect("acquire shared read access on store")
    }

    /// Obtain a write-lock on the store.
    fn write_store(&self) -> RwLockWriteGuard<'_, InnerMemoryStore> {
        self.inner
            .write()
            .expect("acquire exclusive write access on store")
    }
}

impl LedgerStore for MemoryStore {
    async fn reserve(
        &self,
        key: IdempotencyKey,
        owner_id: &str,
        target_id: &str,
        created_at: u64,
    ) -> Result<Reservation, StoreError> {
        let mut store = self.write_store();

        match store.ledger.get(&key) {
            None => {
                let record = IdempotencyRecord {
                    key,
                    owner_id: owner_id.to_string(),
                    target_id: target_id.to_string(),
                    result: None,
                    created_at,
                };
                store.ledger.insert(key, record);
                Ok(Reservation::New)
            }
            Some(record) if record.matches(owner_id, target_id) => {
                Ok(Reservation::Replay(record.clone()))
            }
            Some(_) => Err(StoreError::IdempotencyConflict(key)),
        }
    }

    async fn attach_result(
        &self,
        key: IdempotencyKey,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        if let Some(record) = self.write_store().ledger.get_mut(&key) {
            if record.result.is_none() {
                record.result = Some(result);
            }
        }
        Ok(())
    }

    async fn get_record(
        &self,
        key: IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.read_store().ledger.get(&key).cloned())
    }
}

impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: AttendanceSession) -> Result<(), StoreError> {
        self.write_store().sessions.insert(session.id, session);
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<AttendanceSession>, StoreError> {
        Ok(self.read_store().sessions.get(&id).cloned())
    }

    async fn close_session(&self, id: SessionId) -> Result<AttendanceSession, StoreError> {
        let mut store = self.write_store();
        let session = store
            .sessions
            .get_mut(&id)
            .ok_or(StoreError::SessionNotFound(id))?;
        session.close();
        Ok(session.clone())
    }

    async fn extend_session(
        &self,
        id: SessionId,
        close_at: u64,
    ) -> Result<AttendanceSession, StoreError> {
        let mut store = self.write_store();
        let session = store
            .sessions
            .get_mut(&id)
            .ok_or(StoreError::SessionNotFound(id))?;
        session.extend(close_at)?;
        Ok(session.clone())
    }
}

impl CheckInStore for MemoryStore {
    async fn insert_or_get_check(
        &self,
        session_id: SessionId,
        owner_id: &str,
        ts: u64,
        idempotency_key: IdempotencyKey,
    ) -> Result<(bool, AttendanceCheckRecord), StoreError> {
        let mut store = self.write_store();

        if let Some(existing) = store.checks.get(&(session_id, owner_id.to_string())) {
            return Ok((false, existing.clone()));
        }

        store.next_check_id += 1;
        let record = AttendanceCheckRecord {
            id: store.next_check_id,
            session_id,
            owner_id: owner_id.to_string(),
            ts,
            idempotency_key,
        };
        store
            .checks
            .insert((session_id, owner_id.to_string()), record.clone());
        Ok((true, record))
    }

    async fn checks_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<AttendanceCheckRecord>, StoreError> {
        let mut checks: Vec<AttendanceCheckRecord> = self
            .read_store()
            .checks
            .values()
            .filter(|check| check.session_id == session_id)
            .cloned()
            .collect();
        checks.sort_by_key(|check| check.id);
        Ok(checks)
    }
}

impl AckStore for MemoryStore {
    async fn insert_ack(&self, broadcast_id: &str, owner_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .write_store()
            .acks
            .entry(broadcast_id.to_string())
            .or_default()
            .insert(owner_id.to_string()))
    }

    async fn ack_count(&self, broadcast_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .read_store()
            .acks
            .get(broadcast_id)
            .map(|owners| owners.len() as u64)
            .unwrap_or(0))
    }
}

impl OutboxStore for MemoryStore {
    async fn enqueue(&self, new: NewOutboxItem) -> Result<Option<OutboxItem>, StoreError> {
        let mut store = self.write_store();

        // Enqueue is a no-op when the key is already queued.
        if !store.outbox_keys.insert(new.idempotency_key) {
            return Ok(None);
        }

        store.next_item_id += 1;
        let item = OutboxItem::from_new(store.next_item_id, new);
        store.outbox.insert(item.id, item.clone());
        Ok(Some(item))
    }

    async fn pending(&self, owner_id: &str) -> Result<Vec<OutboxItem>, StoreError> {
        let mut items: Vec<OutboxItem> = self
            .read_store()
            .outbox
            .values()
            .filter(|item| item.owner_id == owner_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.created_at, item.id));
        Ok(items)
    }

    async fn mark_attempt(&self, id: u64, error: &str) -> Result<(), StoreError> {
        if let Some(item) = self.write_store().outbox.get_mut(&id) {
            item.attempts += 1;
            item.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn remove(&self, id: u64, owner_id: &str) -> Result<bool, StoreError> {
        let mut store = self.write_store();
        match store.outbox.get(&id) {
            Some(item) if item.owner_id == owner_id => {
                let key = item.idempotency_key;
                store.outbox.remove(&id);
                store.outbox_keys.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
