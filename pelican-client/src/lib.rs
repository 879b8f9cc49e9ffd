// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device-side half of the pelican offline action pipeline.
//!
//! User actions are written to a durable outbox before any network activity,
//! then drained against the Action API by a dispatcher actor that retries
//! transient failures with backoff and drops terminal rejections. The
//! attendance session controller sits on top: it runs the open / rotate /
//! close display state machine and feeds check-ins into the outbox.
//!
//! Each user session constructs its own dispatcher and controller around an
//! injected store handle, so several accounts can run side by side in one
//! process.
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod session;

pub use api::{ActionApi, ApiError, HttpApi};
pub use config::DispatcherConfig;
pub use dispatcher::{DispatchEvent, Dispatcher};
pub use session::{ControllerError, SessionController};
