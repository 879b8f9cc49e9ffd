// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::{IdempotencyKey, SessionId};

/// Lifecycle state of an attendance session.
///
/// The only transition is `Open -> Closed`, taken at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = UnknownSessionStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "open" => Ok(SessionStatus::Open),
            "closed" => Ok(SessionStatus::Closed),
            _ => Err(UnknownSessionStatus(value.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown session status: {0}")]
pub struct UnknownSessionStatus(pub String);

/// Result of checking a session against a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionValidity {
    /// The session is open and the time falls inside its window.
    Valid,
    /// The session is closed or the time falls outside its window.
    Expired,
    /// No session with the given id exists.
    Unknown,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionTransitionError {
    #[error("cannot extend a closed session")]
    ExtendClosed,

    #[error("close time {0} does not extend current close time {1}")]
    CloseTimeNotExtended(u64, u64),
}

/// A time-bounded roll-call window tied to a course and attendance policy.
///
/// Sessions are append-only history: they are closed, never deleted. The
/// `seed` feeds the rotating display code on the client; the server validates
/// only the session id and the `[open_at, close_at)` window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSession {
    pub id: SessionId,
    pub course_id: String,
    pub policy_id: String,
    pub open_at: u64,
    pub close_at: u64,
    #[serde(rename = "qrSeed")]
    pub seed: String,
    pub status: SessionStatus,
}

impl AttendanceSession {
    /// Close the session.
    ///
    /// Returns `true` when the transition occurred, or `false` when the
    /// session was already closed and nothing changed.
    pub fn close(&mut self) -> bool {
        match self.status {
            SessionStatus::Open => {
                self.status = SessionStatus::Closed;
                true
            }
            SessionStatus::Closed => false,
        }
    }

    /// Move the close time forward while the session is still open.
    pub fn extend(&mut self, close_at: u64) -> Result<(), SessionTransitionError> {
        if self.status == SessionStatus::Closed {
            return Err(SessionTransitionError::ExtendClosed);
        }
        if close_at <= self.close_at {
            return Err(SessionTransitionError::CloseTimeNotExtended(
                close_at,
                self.close_at,
            ));
        }
        self.close_at = close_at;
        Ok(())
    }

    /// Check whether a check-in at the given time falls inside the window.
    pub fn verify(&self, at: u64) -> SessionValidity {
        if self.status == SessionStatus::Open && self.open_at <= at && at < self.close_at {
            SessionValidity::Valid
        } else {
            SessionValidity::Expired
        }
    }
}

/// One accepted check-in, unique per `(session_id, owner_id)`.
///
/// A second check-in for the same session and user returns this original
/// record rather than creating a duplicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCheckRecord {
    pub id: u64,
    #[serde(rename = "sessId")]
    pub session_id: SessionId,
    #[serde(rename = "uid")]
    pub owner_id: String,
    pub ts: u64,
    pub idempotency_key: IdempotencyKey,
}
