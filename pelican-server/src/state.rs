// SPDX-License-Identifier: MIT OR Apache-2.0

use pelican_store::{AckStore, CheckInStore, LedgerStore, SessionStore};

use crate::config::ServerConfig;

/// Bundle of store interfaces the Action API needs.
///
/// Implemented automatically for any store covering all server-side
/// concerns, such as `MemoryStore` or `SqliteStore`.
pub trait ServerStore:
    LedgerStore + SessionStore + CheckInStore + AckStore + Clone + Send + Sync + 'static
{
}

impl<S> ServerStore for S where
    S: LedgerStore + SessionStore + CheckInStore + AckStore + Clone + Send + Sync + 'static
{
}

/// Shared state handed to every handler.
#[derive(Clone, Debug)]
pub struct AppState<S> {
    pub store: S,
    pub config: ServerConfig,
}

impl<S> AppState<S>
where
    S: ServerStore,
{
    pub fn new(store: S, config: ServerConfig) -> Self {
        Self { store, config }
    }
}
