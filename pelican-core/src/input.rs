// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;
use url::Url;

use crate::key::SessionId;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("input is empty")]
    Empty,

    #[error("input does not contain a session id: {0}")]
    NoSessionId(String),
}

/// Normalize user-entered or scanned check-in input to a session id.
///
/// Accepted shapes, tried in order:
///
/// - a raw hex session id,
/// - a URL carrying the id in a `sessId` query parameter,
/// - a URL whose last path segment is the id.
///
/// Scanned QR payloads are typically deep links, so the URL forms matter as
/// much as the raw id.
pub fn parse_session_input(input: &str) -> Result<SessionId, InputError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(InputError::Empty);
    }

    if let Ok(id) = input.parse::<SessionId>() {
        return Ok(id);
    }

    let url = Url::parse(input).map_err(|_| InputError::NoSessionId(input.to_string()))?;

    if let Some((_, value)) = url.query_pairs().find(|(name, _)| name == "sessId") {
        if let Ok(id) = value.parse::<SessionId>() {
            return Ok(id);
        }
    }

    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|segment| segment.parse::<SessionId>().ok())
        .ok_or_else(|| InputError::NoSessionId(input.to_string()))
}

#[cfg(test)]
mod tests {
    use crate::{ID_LEN, SessionId};

    use super::parse_session_input;

    fn id() -> SessionId {
        SessionId::from_bytes([42; ID_LEN])
    }

    #[test]
    fn raw_id() {
        assert_eq!(parse_session_input(&id().to_hex()).unwrap(), id());
        assert_eq!(
            parse_session_input(&format!("  {}  ", id().to_hex())).unwrap(),
            id()
        );
    }

    #[test]
    fn query_parameter() {
        let input = format!("https://campus.example/checkin?sessId={}", id().to_hex());
        assert_eq!(parse_session_input(&input).unwrap(), id());
    }

    #[test]
    fn path_segment() {
        let input = format!("https://campus.example/attendance/{}", id().to_hex());
        assert_eq!(parse_session_input(&input).unwrap(), id());
    }

    #[test]
    fn query_parameter_wins_over_path() {
        let other = SessionId::from_bytes([9; ID_LEN]);
        let input = format!(
            "https://campus.example/attendance/{}?sessId={}",
            other.to_hex(),
            id().to_hex()
        );
        assert_eq!(parse_session_input(&input).unwrap(), id());
    }

    #[test]
    fn rejects_junk() {
        assert!(parse_session_input("").is_err());
        assert!(parse_session_input("not a session").is_err());
        assert!(parse_session_input("https://campus.example/attendance/nope").is_err());
    }
}
