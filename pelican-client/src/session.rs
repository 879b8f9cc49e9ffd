// SPDX-License-Identifier: MIT OR Apache-2.0

//! Manager-side attendance session controller.
//!
//! Drives the open / rotate / close lifecycle of a roll-call session and
//! feeds check-ins into the outbox. The rotation is purely cosmetic: the
//! server validates the session id and time window, so a check-in scanned
//! from a stale display remains valid while the session is open.
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use pelican_core::{ActionKind, InputError, SessionId, now_unix, parse_session_input};
use pelican_store::{OutboxStore, StoreError};

use crate::api::{ActionApi, ApiError};
use crate::dispatcher::Dispatcher;

/// Default lifetime of one displayed code, in seconds.
pub const DEFAULT_VALID_DURATION: u64 = 30;

#[derive(Error, Debug)]
pub enum ControllerError {
    /// Check-in input could not be normalized to a session id.
    #[error(transparent)]
    Input(#[from] InputError),

    /// The server rejected the request terminally.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The local outbox failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The server reply carried no usable session id.
    #[error("malformed session reply")]
    MalformedReply,
}

/// Client-side state machine for one device.
///
/// Not a task itself: the owning view drives [`SessionController::tick`] from
/// a one-second timer tied to its own lifetime and reads the displayed code
/// back out after each tick.
#[derive(Debug)]
pub struct SessionController<S, A> {
    api: A,
    dispatcher: Dispatcher<S>,
    valid_duration: u64,
    session_id: Option<SessionId>,
    displayed_code: String,
    ttl: u64,
}

impl<S, A> SessionController<S, A>
where
    S: OutboxStore + Clone + Send + Sync + 'static,
    A: ActionApi,
{
    pub fn new(api: A, dispatcher: Dispatcher<S>, valid_duration: u64) -> Self {
        Self {
            api,
            dispatcher,
            valid_duration,
            session_id: None,
            displayed_code: SessionId::new().to_hex(),
            ttl: valid_duration,
        }
    }

    /// Currently displayed code.
    pub fn displayed_code(&self) -> &str {
        &self.displayed_code
    }

    /// Seconds until the displayed code rotates.
    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    /// Active session id, if a session is open on this device.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Open a roll-call session.
    ///
    /// Tries the API directly so the real session id can be displayed right
    /// away. On a transient failure the open is deferred: a `sessionOpen`
    /// outbox item is queued for later delivery and a local placeholder id
    /// unblocks the UI. Terminal rejections are returned to the caller
    /// unqueued, since retrying an invalid request cannot succeed.
    pub async fn open_session(
        &mut self,
        course_id: &str,
        policy_id: &str,
        open_at: u64,
        close_at: u64,
    ) -> Result<SessionId, ControllerError> {
        let body = json!({
            "courseId": course_id,
            "policyId": policy_id,
            "openAt": open_at,
            "closeAt": close_at,
        });

        let session_id = match self.api.open_session(&body, None).await {
            Ok(reply) => reply
                .get("id")
                .and_then(|id| id.as_str())
                .and_then(|id| id.parse().ok())
                .ok_or(ControllerError::MalformedReply)?,
            Err(err) if err.is_transient() => {
                warn!("deferring session open for course {course_id}: {err}");
                self.dispatcher.enqueue(ActionKind::SessionOpen, body).await?;
                SessionId::new()
            }
            Err(err) => return Err(err.into()),
        };

        self.session_id = Some(session_id);
        self.rotate();
        Ok(session_id)
    }

    /// Queue an attendance check-in for scanned or typed input.
    ///
    /// The outbox write completes before any delivery attempt starts, so a
    /// crash right after this returns loses nothing.
    pub async fn check_in(&self, owner_id: &str, input: &str) -> Result<SessionId, ControllerError> {
        let session_id = parse_session_input(input)?;
        let payload = json!({
            "sessId": session_id,
            "uid": owner_id,
            "ts": now_unix(),
        });

        if self
            .dispatcher
            .enqueue(ActionKind::AttendanceCheck, payload)
            .await?
            .is_none()
        {
            debug!("check-in for session {session_id} already queued");
        }
        Ok(session_id)
    }

    /// Close the active session, if any.
    ///
    /// Queued rather than sent directly: the close must survive the device
    /// going offline mid-action, and closing is idempotent server-side.
    pub async fn close_session(&mut self) -> Result<(), ControllerError> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };

        self.dispatcher
            .enqueue(ActionKind::SessionClose, json!({ "sessId": session_id }))
            .await?;
        self.rotate();
        Ok(())
    }

    /// Advance the one-second display timer.
    ///
    /// At zero the displayed code regenerates and the timer resets to the
    /// configured duration.
    pub fn tick(&mut self) {
        self.ttl = self.ttl.saturating_sub(1);
        if self.ttl == 0 {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        self.displayed_code = match self.session_id {
            Some(session_id) => session_id.to_hex(),
            None => SessionId::new().to_hex(),
        };
        self.ttl = self.valid_duration;
    }
}
