// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;

const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 4130);

/// Configuration parameters for the Action API server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Socket address the server binds to.
    ///
    /// Default: `0.0.0.0:4130`.
    pub(crate) bind_addr: SocketAddr,

    /// Reject attendance check-ins against unknown sessions (`E-SRV-404`)
    /// and closed or out-of-window sessions (`E-SESSION-EXPIRED`).
    ///
    /// When disabled the server accepts and records such check-ins anyway,
    /// which is only appropriate for demo deployments.
    ///
    /// Default: `true`.
    pub(crate) strict_sessions: bool,
}

impl ServerConfig {
    /// Return a default instance of `ServerConfig`.
    pub fn new() -> Self {
        Default::default()
    }

    /// Define the socket address the server binds to.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Enable or disable strict session verification for check-ins.
    pub fn strict_sessions(mut self, strict: bool) -> Self {
        self.strict_sessions = strict;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(DEFAULT_BIND_ADDR),
            strict_sessions: true,
        }
    }
}
