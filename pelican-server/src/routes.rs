// SPDX-License-Identifier: MIT OR Apache-2.0

//! Action API handlers.
//!
//! Every state-changing handler follows the same shape: validate fields,
//! resolve the idempotency key, reserve it in the ledger, apply the side
//! effect exactly once and attach its result to the reservation. Replays
//! answer with the stored result; a key reused for a different target is a
//! conflict. Retries are strictly a client concern; no handler retries
//! anything.
use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use pelican_core::{
    AttendanceCheckRecord, AttendanceSession, IdempotencyKey, SessionId, SessionStatus,
    SessionValidity, now_unix,
};
use pelican_store::{AckStore, CheckInStore, LedgerStore, Reservation, SessionStore};

use crate::error::ApiError;
use crate::state::{AppState, ServerStore};

/// Name of the idempotency key request header.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Resolve the idempotency key of a request, if one was supplied.
///
/// The `Idempotency-Key` header is the primary convention; a body field is
/// accepted as fallback. A key that is present but malformed is a validation
/// error, never silently ignored.
fn optional_idempotency_key(
    headers: &HeaderMap,
    body_key: Option<&str>,
) -> Result<Option<IdempotencyKey>, ApiError> {
    let raw = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::Validation("malformed Idempotency-Key header".to_string()))
        })
        .transpose()?
        .or(body_key);

    match raw {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ApiError::Validation("malformed idempotency key".to_string())),
        None => Ok(None),
    }
}

/// Resolve the idempotency key for an endpoint that requires one; without a
/// key the ledger cannot deduplicate retries.
fn idempotency_key(headers: &HeaderMap, body_key: Option<&str>) -> Result<IdempotencyKey, ApiError> {
    optional_idempotency_key(headers, body_key)?.ok_or_else(|| ApiError::missing("idempotencyKey"))
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("no attendance session with id {raw}")))
}

fn check_response(record: &AttendanceCheckRecord) -> Value {
    json!({
        "id": record.id,
        "sessId": record.session_id,
        "uid": record.owner_id,
        "ts": record.ts,
        "status": "ok",
    })
}

fn session_response(session: &AttendanceSession) -> Value {
    json!({
        "id": session.id,
        "courseId": session.course_id,
        "policyId": session.policy_id,
        "openAt": session.open_at,
        "closeAt": session.close_at,
        "qrSeed": session.seed,
        "status": session.status,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    uid: Option<String>,
    idempotency_key: Option<String>,
}

/// `POST /v1/broadcasts/{id}/ack`
pub async fn ack<S: ServerStore>(
    State(state): State<AppState<S>>,
    Path(broadcast_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<AckRequest>,
) -> Result<Json<Value>, ApiError> {
    let uid = request.uid.ok_or_else(|| ApiError::missing("uid"))?;
    let key = idempotency_key(&headers, request.idempotency_key.as_deref())?;

    match state
        .store
        .reserve(key, &uid, &broadcast_id, now_unix())
        .await?
    {
        Reservation::New => {
            state.store.insert_ack(&broadcast_id, &uid).await?;
            let result = json!({ "status": "ok" });
            state.store.attach_result(key, result.clone()).await?;
            Ok(Json(result))
        }
        Reservation::Replay(record) => {
            debug!("replayed ack for broadcast {broadcast_id} by {uid}");
            match record.result {
                Some(result) => Ok(Json(result)),
                // The first attempt died between reservation and completion;
                // the ack insert is a set operation, so applying again
                // recovers it.
                None => {
                    state.store.insert_ack(&broadcast_id, &uid).await?;
                    let result = json!({ "status": "ok" });
                    state.store.attach_result(key, result.clone()).await?;
                    Ok(Json(result))
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockRecordRequest {
    uid: Option<String>,
    site_id: Option<String>,
    ts: Option<u64>,
    gps: Option<Value>,
    idempotency_key: Option<String>,
}

/// `POST /v1/clock/records`
pub async fn clock_record<S: ServerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(request): Json<ClockRecordRequest>,
) -> Result<Json<Value>, ApiError> {
    let uid = request.uid.ok_or_else(|| ApiError::missing("uid"))?;
    let site_id = request.site_id.ok_or_else(|| ApiError::missing("siteId"))?;
    let ts = request.ts.ok_or_else(|| ApiError::missing("ts"))?;
    let key = idempotency_key(&headers, request.idempotency_key.as_deref())?;

    let record = json!({
        "id": key,
        "uid": uid.as_str(),
        "siteId": site_id.as_str(),
        "ts": ts,
        "gps": request.gps,
        "status": "ok",
    });

    match state.store.reserve(key, &uid, &site_id, now_unix()).await? {
        Reservation::New => {
            state.store.attach_result(key, record.clone()).await?;
            Ok(Json(record))
        }
        Reservation::Replay(stored) => match stored.result {
            Some(result) => {
                debug!("replayed clock record for {uid} at site {site_id}");
                Ok(Json(result))
            }
            // The first attempt died between reservation and completion; the
            // record is deterministic from the request, so rebuild and attach
            // it.
            None => {
                state.store.attach_result(key, record.clone()).await?;
                Ok(Json(record))
            }
        },
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCheckRequest {
    sess_id: Option<String>,
    uid: Option<String>,
    ts: Option<u64>,
    idempotency_key: Option<String>,
}

/// `POST /v1/attendance/check`
///
/// Session verification policy: with `strict_sessions` (the default) a
/// check-in against an unknown session is a 404 and one outside the open
/// window is rejected as expired. The lenient mode records the check-in
/// regardless, for demo deployments where sessions may be created after the
/// fact.
pub async fn attendance_check<S: ServerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(request): Json<AttendanceCheckRequest>,
) -> Result<Json<Value>, ApiError> {
    let session_id = request
        .sess_id
        .ok_or_else(|| ApiError::missing("sessId"))?
        .parse::<SessionId>()
        .map_err(|_| ApiError::Validation("malformed sessId".to_string()))?;
    let uid = request.uid.ok_or_else(|| ApiError::missing("uid"))?;
    let key = idempotency_key(&headers, request.idempotency_key.as_deref())?;
    let ts = request.ts.unwrap_or_else(now_unix);

    if state.config.strict_sessions {
        match state.store.get_session(session_id).await? {
            None => {
                return Err(ApiError::NotFound(format!(
                    "no attendance session with id {session_id}"
                )));
            }
            Some(session) if session.verify(ts) != SessionValidity::Valid => {
                return Err(ApiError::SessionExpired);
            }
            Some(_) => {}
        }
    }

    // Reserve against the normalized id, so retries that render the same id
    // differently (case, URL form) still replay.
    let reservation = state
        .store
        .reserve(key, &uid, &session_id.to_hex(), now_unix())
        .await?;

    match reservation {
        Reservation::New => {
            let (_, record) = state
                .store
                .insert_or_get_check(session_id, &uid, ts, key)
                .await?;
            let result = check_response(&record);
            state.store.attach_result(key, result.clone()).await?;
            Ok(Json(result))
        }
        Reservation::Replay(ledger_record) => {
            debug!("replayed check-in for session {session_id} by {uid}");
            match ledger_record.result {
                Some(result) => Ok(Json(result)),
                // The first attempt died between reservation and completion;
                // the check store is idempotent, so applying again recovers
                // the record.
                None => {
                    let (_, record) = state
                        .store
                        .insert_or_get_check(session_id, &uid, ts, key)
                        .await?;
                    let result = check_response(&record);
                    state.store.attach_result(key, result.clone()).await?;
                    Ok(Json(result))
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    course_id: Option<String>,
    policy_id: Option<String>,
    #[serde(alias = "open_at")]
    open_at: Option<u64>,
    #[serde(alias = "close_at")]
    close_at: Option<u64>,
    uid: Option<String>,
    idempotency_key: Option<String>,
}

/// `POST /v1/attendance/sessions`
///
/// The idempotency key is optional here: interactive session creation calls
/// this endpoint directly, while deferred `sessionOpen` outbox items carry a
/// key so that retried opens do not create duplicate sessions. Keyed opens
/// derive the session id from the key, which pins an interrupted first
/// attempt and all of its retries to one session.
pub async fn create_session<S: ServerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    let course_id = request
        .course_id
        .ok_or_else(|| ApiError::missing("courseId"))?;
    let policy_id = request
        .policy_id
        .ok_or_else(|| ApiError::missing("policyId"))?;
    let open_at = request.open_at.ok_or_else(|| ApiError::missing("openAt"))?;
    let close_at = request
        .close_at
        .ok_or_else(|| ApiError::missing("closeAt"))?;

    if close_at <= open_at {
        return Err(ApiError::Validation(
            "closeAt must be after openAt".to_string(),
        ));
    }

    let key = optional_idempotency_key(&headers, request.idempotency_key.as_deref())?;
    let uid = request.uid.unwrap_or_default();

    let session_id = match key {
        Some(key) => SessionId::from_bytes(*key.as_bytes()),
        None => SessionId::new(),
    };

    if let Some(key) = key {
        match state.store.reserve(key, &uid, &course_id, now_unix()).await? {
            Reservation::Replay(record) => {
                if let Some(result) = record.result {
                    debug!("replayed session open for course {course_id}");
                    return Ok(Json(result));
                }
                // The first attempt died between reservation and completion.
                // The session id is derived from the key, so the session it
                // wrote, if any, is recoverable rather than minted a second
                // time.
                if let Some(session) = state.store.get_session(session_id).await? {
                    let result = session_response(&session);
                    state.store.attach_result(key, result.clone()).await?;
                    return Ok(Json(result));
                }
            }
            Reservation::New => {}
        }
    }

    let session = AttendanceSession {
        id: session_id,
        course_id,
        policy_id,
        open_at,
        close_at,
        seed: IdempotencyKey::new().to_hex(),
        status: SessionStatus::Open,
    };
    state.store.insert_session(session.clone()).await?;

    let result = session_response(&session);
    if let Some(key) = key {
        state.store.attach_result(key, result.clone()).await?;
    }
    Ok(Json(result))
}

/// `POST /v1/attendance/sessions/{id}/close`
///
/// Naturally idempotent: closing an already-closed session returns the same
/// terminal record, so no ledger reservation is involved.
pub async fn close_session<S: ServerStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let session = state.store.close_session(session_id).await?;
    Ok(Json(session_response(&session)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendSessionRequest {
    #[serde(alias = "close_at")]
    close_at: Option<u64>,
}

/// `POST /v1/attendance/sessions/{id}/extend`
pub async fn extend_session<S: ServerStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
    Json(request): Json<ExtendSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let close_at = request
        .close_at
        .ok_or_else(|| ApiError::missing("closeAt"))?;
    let session = state.store.extend_session(session_id, close_at).await?;
    Ok(Json(session_response(&session)))
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use pelican_core::{
        AttendanceSession, IdempotencyKey, SessionId, SessionStatus, now_unix,
    };
    use pelican_store::{AckStore, LedgerStore, MemoryStore, OutboxStore, SessionStore};

    use crate::config::ServerConfig;
    use crate::state::AppState;
    use crate::{app, routes::IDEMPOTENCY_KEY_HEADER};

    fn test_app(store: MemoryStore) -> Router {
        app(AppState::new(store, ServerConfig::new()))
    }

    fn lenient_app(store: MemoryStore) -> Router {
        app(AppState::new(
            store,
            ServerConfig::new().strict_sessions(false),
        ))
    }

    async fn post(
        app: &Router,
        uri: &str,
        key: Option<&IdempotencyKey>,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, key.to_hex());
        }
        let request = request.body(Body::from(body.to_string())).unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn open_session(app: &Router, open_at: u64, close_at: u64) -> String {
        let (status, body) = post(
            app,
            "/v1/attendance/sessions",
            None,
            json!({
                "courseId": "course-1",
                "policyId": "policy-1",
                "openAt": open_at,
                "closeAt": close_at,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "open");
        assert!(body["qrSeed"].is_string());
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let store = MemoryStore::new();
        let app = test_app(store.clone());
        let key = IdempotencyKey::new();
        let body = json!({ "uid": "u1" });

        let (status, first) = post(&app, "/v1/broadcasts/b1/ack", Some(&key), body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "ok");

        let (status, second) = post(&app, "/v1/broadcasts/b1/ack", Some(&key), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);

        // Acknowledged once, not twice.
        assert_eq!(store.ack_count("b1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ack_key_reuse_for_different_target_conflicts() {
        let app = test_app(MemoryStore::new());
        let key = IdempotencyKey::new();

        let (status, _) = post(
            &app,
            "/v1/broadcasts/b1/ack",
            Some(&key),
            json!({ "uid": "u1" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = post(
            &app,
            "/v1/broadcasts/b1/ack",
            Some(&key),
            json!({ "uid": "u2" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "E-IDEMP-409");
    }

    #[tokio::test]
    async fn ack_missing_uid_is_a_validation_error() {
        let app = test_app(MemoryStore::new());

        let (status, body) = post(
            &app,
            "/v1/broadcasts/b1/ack",
            Some(&IdempotencyKey::new()),
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "E-VAL-422");
    }

    #[tokio::test]
    async fn ack_accepts_body_key_as_fallback() {
        let app = test_app(MemoryStore::new());
        let key = IdempotencyKey::new();

        let (status, _) = post(
            &app,
            "/v1/broadcasts/b1/ack",
            None,
            json!({ "uid": "u1", "idempotencyKey": key.to_hex() }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Replay via the header form of the same key.
        let (status, body) = post(
            &app,
            "/v1/broadcasts/b1/ack",
            Some(&key),
            json!({ "uid": "u1" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn ack_without_any_key_is_rejected() {
        let app = test_app(MemoryStore::new());
        let (status, body) = post(&app, "/v1/broadcasts/b1/ack", None, json!({ "uid": "u1" })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "E-VAL-422");
    }

    #[tokio::test]
    async fn clock_record_replays_the_original_record() {
        let app = test_app(MemoryStore::new());
        let key = IdempotencyKey::new();
        let body = json!({ "uid": "u1", "siteId": "site-9", "ts": 1234, "gps": [1.5, 2.5] });

        let (status, first) = post(&app, "/v1/clock/records", Some(&key), body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["siteId"], "site-9");
        assert_eq!(first["gps"], json!([1.5, 2.5]));

        let (status, second) = post(&app, "/v1/clock/records", Some(&key), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn clock_record_requires_site_id() {
        let app = test_app(MemoryStore::new());
        let (status, body) = post(
            &app,
            "/v1/clock/records",
            Some(&IdempotencyKey::new()),
            json!({ "uid": "u1", "ts": 1 }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "E-VAL-422");
    }

    #[tokio::test]
    async fn check_in_dedup_and_ledger_replay() {
        let app = test_app(MemoryStore::new());
        let now = now_unix();
        let session_id = open_session(&app, now - 60, now + 600).await;

        let key = IdempotencyKey::new();
        let body = json!({ "sessId": session_id, "uid": "u1", "ts": now });
        let (status, first) = post(&app, "/v1/attendance/check", Some(&key), body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "ok");

        // Dropped-ack retry with the same key replays the stored result.
        let (status, replay) = post(&app, "/v1/attendance/check", Some(&key), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replay, first);

        // A fresh key for the same user and session resolves to the same
        // logical record.
        let (status, second) = post(
            &app,
            "/v1/attendance/check",
            Some(&IdempotencyKey::new()),
            json!({ "sessId": session_id, "uid": "u1", "ts": now + 60 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["id"], first["id"]);
        assert_eq!(second["ts"], first["ts"]);
    }

    #[tokio::test]
    async fn strict_mode_rejects_unknown_and_expired_sessions() {
        let app = test_app(MemoryStore::new());
        let now = now_unix();

        let (status, body) = post(
            &app,
            "/v1/attendance/check",
            Some(&IdempotencyKey::new()),
            json!({ "sessId": IdempotencyKey::new().to_hex(), "uid": "u1" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "E-SRV-404");

        let session_id = open_session(&app, now - 600, now - 60).await;
        let (status, body) = post(
            &app,
            "/v1/attendance/check",
            Some(&IdempotencyKey::new()),
            json!({ "sessId": session_id, "uid": "u1", "ts": now }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "E-SESSION-EXPIRED");
    }

    #[tokio::test]
    async fn lenient_mode_accepts_unknown_sessions() {
        let app = lenient_app(MemoryStore::new());

        let (status, body) = post(
            &app,
            "/v1/attendance/check",
            Some(&IdempotencyKey::new()),
            json!({ "sessId": IdempotencyKey::new().to_hex(), "uid": "u1", "ts": 5 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn session_create_validates_window() {
        let app = test_app(MemoryStore::new());
        let (status, body) = post(
            &app,
            "/v1/attendance/sessions",
            None,
            json!({ "courseId": "c", "policyId": "p", "openAt": 100, "closeAt": 100 }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "E-VAL-422");
    }

    #[tokio::test]
    async fn session_create_accepts_snake_case_aliases() {
        let app = test_app(MemoryStore::new());
        let (status, body) = post(
            &app,
            "/v1/attendance/sessions",
            None,
            json!({ "courseId": "c", "policyId": "p", "open_at": 100, "close_at": 200 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["openAt"], 100);
    }

    #[tokio::test]
    async fn deferred_session_open_with_key_is_idempotent() {
        let app = test_app(MemoryStore::new());
        let key = IdempotencyKey::new();
        let body = json!({ "courseId": "c", "policyId": "p", "openAt": 100, "closeAt": 200 });

        let (status, first) = post(&app, "/v1/attendance/sessions", Some(&key), body.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, second) = post(&app, "/v1/attendance/sessions", Some(&key), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["id"], first["id"]);
    }

    #[tokio::test]
    async fn session_close_is_idempotent_and_terminal() {
        let app = test_app(MemoryStore::new());
        let session_id = open_session(&app, 0, 100).await;

        let uri = format!("/v1/attendance/sessions/{session_id}/close");
        let (status, first) = post(&app, &uri, None, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "closed");

        let (status, second) = post(&app, &uri, None, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn session_close_unknown_is_not_found() {
        let app = test_app(MemoryStore::new());
        let uri = format!(
            "/v1/attendance/sessions/{}/close",
            IdempotencyKey::new().to_hex()
        );
        let (status, body) = post(&app, &uri, None, json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "E-SRV-404");
    }

    #[tokio::test]
    async fn session_extend_only_while_open() {
        let app = test_app(MemoryStore::new());
        let session_id = open_session(&app, 0, 100).await;
        let uri = format!("/v1/attendance/sessions/{session_id}/extend");

        let (status, body) = post(&app, &uri, None, json!({ "closeAt": 300 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["closeAt"], 300);

        let close_uri = format!("/v1/attendance/sessions/{session_id}/close");
        post(&app, &close_uri, None, json!({})).await;

        let (status, body) = post(&app, &uri, None, json!({ "closeAt": 500 })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "E-VAL-422");
    }

    #[tokio::test]
    async fn interrupted_session_open_recovers_the_written_session() {
        let store = MemoryStore::new();
        let app = test_app(store.clone());
        let key = IdempotencyKey::new();
        let body = json!({ "courseId": "c", "policyId": "p", "openAt": 100, "closeAt": 200 });

        // First attempt died after reserving the key and writing the session
        // but before attaching the result.
        store.reserve(key, "", "c", now_unix()).await.unwrap();
        let session = AttendanceSession {
            id: SessionId::from_bytes(*key.as_bytes()),
            course_id: "c".to_string(),
            policy_id: "p".to_string(),
            open_at: 100,
            close_at: 200,
            seed: "seed".to_string(),
            status: SessionStatus::Open,
        };
        store.insert_session(session.clone()).await.unwrap();

        let (status, replay) = post(&app, "/v1/attendance/sessions", Some(&key), body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replay["id"], session.id.to_hex());

        // The retry completed the record, so further retries are plain
        // replays of it.
        let (status, again) = post(&app, "/v1/attendance/sessions", Some(&key), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again, replay);
    }

    #[tokio::test]
    async fn interrupted_session_open_before_write_creates_one_session() {
        let store = MemoryStore::new();
        let app = test_app(store.clone());
        let key = IdempotencyKey::new();
        let body = json!({ "courseId": "c", "policyId": "p", "openAt": 100, "closeAt": 200 });

        // First attempt died right after reserving the key, before the
        // session was written.
        store.reserve(key, "", "c", now_unix()).await.unwrap();

        let (status, first) = post(&app, "/v1/attendance/sessions", Some(&key), body.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, second) = post(&app, "/v1/attendance/sessions", Some(&key), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["id"], first["id"]);

        // Exactly one session exists under this key.
        let session_id = SessionId::from_bytes(*key.as_bytes());
        assert_eq!(first["id"], session_id.to_hex());
        assert!(store.get_session(session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn interrupted_ack_recovers_on_retry() {
        let store = MemoryStore::new();
        let app = test_app(store.clone());
        let key = IdempotencyKey::new();

        // First attempt died between reservation and the ack insert.
        store.reserve(key, "u1", "b1", now_unix()).await.unwrap();

        let (status, body) = post(
            &app,
            "/v1/broadcasts/b1/ack",
            Some(&key),
            json!({ "uid": "u1" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(store.ack_count("b1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn interrupted_clock_record_is_rebuilt_on_retry() {
        let store = MemoryStore::new();
        let app = test_app(store.clone());
        let key = IdempotencyKey::new();
        let body = json!({ "uid": "u1", "siteId": "site-9", "ts": 1234 });

        // First attempt died between reservation and attaching the record.
        store.reserve(key, "u1", "site-9", now_unix()).await.unwrap();

        let (status, first) = post(&app, "/v1/clock/records", Some(&key), body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["id"], key.to_hex());
        assert_eq!(first["siteId"], "site-9");

        let (status, second) = post(&app, "/v1/clock/records", Some(&key), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn check_in_replay_ignores_session_id_rendering() {
        let app = test_app(MemoryStore::new());
        let now = now_unix();
        let session_id = open_session(&app, now - 60, now + 600).await;

        let key = IdempotencyKey::new();
        let (status, first) = post(
            &app,
            "/v1/attendance/check",
            Some(&key),
            json!({ "sessId": session_id, "uid": "u1", "ts": now }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // The same logical retry spelling the id in uppercase hex must
        // replay, not conflict.
        let (status, replay) = post(
            &app,
            "/v1/attendance/check",
            Some(&key),
            json!({ "sessId": session_id.to_uppercase(), "uid": "u1", "ts": now }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replay, first);
    }

    #[tokio::test]
    async fn validation_errors_do_not_reserve_the_key() {
        let store = MemoryStore::new();
        let app = test_app(store.clone());
        let key = IdempotencyKey::new();

        let (status, _) = post(&app, "/v1/broadcasts/b1/ack", Some(&key), json!({})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        // The key is still fresh for a corrected retry.
        let (status, _) = post(
            &app,
            "/v1/broadcasts/b1/ack",
            Some(&key),
            json!({ "uid": "u1" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Unrelated sanity check that the store handle is live.
        assert!(store.pending("u1").await.unwrap().is_empty());
    }
}
