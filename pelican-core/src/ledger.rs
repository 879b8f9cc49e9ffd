// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::key::IdempotencyKey;

/// Server-side record of the first successful application of an idempotency
/// key.
///
/// Once written, the identifying fields never change: a later request reusing
/// the key must carry the same `(owner_id, target_id)` pair to be treated as
/// a replay; anything else is a conflict. The `result` payload is attached
/// after the side effect has been applied and is returned verbatim to
/// replayed requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub owner_id: String,
    pub target_id: String,
    pub result: Option<serde_json::Value>,
    pub created_at: u64,
}

impl IdempotencyRecord {
    /// Does a request with the given identity replay this record?
    pub fn matches(&self, owner_id: &str, target_id: &str) -> bool {
        self.owner_id == owner_id && self.target_id == target_id
    }
}
