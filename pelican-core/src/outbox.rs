// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::key::IdempotencyKey;

/// Kind of state-changing action a queued outbox item performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Ack,
    AttendanceCheck,
    SessionOpen,
    SessionClose,
    ClockRecord,
}

impl ActionKind {
    /// Stable wire name of the action kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Ack => "ack",
            ActionKind::AttendanceCheck => "attendanceCheck",
            ActionKind::SessionOpen => "sessionOpen",
            ActionKind::SessionClose => "sessionClose",
            ActionKind::ClockRecord => "clockRecord",
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = UnknownActionKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ack" => Ok(ActionKind::Ack),
            "attendanceCheck" => Ok(ActionKind::AttendanceCheck),
            "sessionOpen" => Ok(ActionKind::SessionOpen),
            "sessionClose" => Ok(ActionKind::SessionClose),
            "clockRecord" => Ok(ActionKind::ClockRecord),
            _ => Err(UnknownActionKind(value.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown action kind: {0}")]
pub struct UnknownActionKind(pub String);

/// Input for enqueueing a new outbox item.
///
/// The store assigns the item id; `created_at` is fixed at enqueue time so
/// that drain order survives restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOutboxItem {
    pub kind: ActionKind,
    pub payload: serde_json::Value,
    pub idempotency_key: IdempotencyKey,
    pub owner_id: String,
    pub created_at: u64,
}

/// A pending action in the durable client-side queue.
///
/// Exactly one item exists per idempotency key; enqueueing the same key again
/// is a no-op. Items are removed on confirmed delivery or on a terminal
/// server response, and only ever mutated by attempt bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub id: u64,
    pub kind: ActionKind,
    pub payload: serde_json::Value,
    pub idempotency_key: IdempotencyKey,
    pub owner_id: String,
    pub created_at: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxItem {
    /// Construct a stored item from enqueue input and a store-assigned id.
    pub fn from_new(id: u64, new: NewOutboxItem) -> Self {
        Self {
            id,
            kind: new.kind,
            payload: new.payload,
            idempotency_key: new.idempotency_key,
            owner_id: new.owner_id,
            created_at: new.created_at,
            attempts: 0,
            last_error: None,
        }
    }
}
