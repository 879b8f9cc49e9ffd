// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable error codes carried in Action API error bodies.
///
/// Clients classify server rejections by code, not by prose, so these values
/// are part of the wire contract and never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A required field is missing or malformed. Terminal; never retried.
    #[serde(rename = "E-VAL-422")]
    Validation,

    /// The idempotency key was already used for a different target. Terminal;
    /// indicates a client bug.
    #[serde(rename = "E-IDEMP-409")]
    IdempotencyConflict,

    /// The referenced session or entity does not exist. Terminal.
    #[serde(rename = "E-SRV-404")]
    NotFound,

    /// The referenced session exists but its check-in window has passed.
    /// Terminal.
    #[serde(rename = "E-SESSION-EXPIRED")]
    SessionExpired,

    /// The server failed to apply the action. Retryable.
    #[serde(rename = "E-SRV-500")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "E-VAL-422",
            ErrorCode::IdempotencyConflict => "E-IDEMP-409",
            ErrorCode::NotFound => "E-SRV-404",
            ErrorCode::SessionExpired => "E-SESSION-EXPIRED",
            ErrorCode::Internal => "E-SRV-500",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
