// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pelican_server::ServerConfig;

/// Environment variable overriding the bind address.
const ENV_ADDR: &str = "PELICAN_ADDR";

/// Environment variable selecting the SQLite database url. Without it the
/// server runs on the in-memory store and loses all state on restart.
#[cfg(feature = "sqlite")]
const ENV_DB: &str = "PELICAN_DB";

/// Environment variable disabling strict session verification.
const ENV_LENIENT: &str = "PELICAN_LENIENT_SESSIONS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::new();
    if let Ok(addr) = std::env::var(ENV_ADDR) {
        let addr = addr
            .parse()
            .with_context(|| format!("{ENV_ADDR} is not a socket address: {addr}"))?;
        config = config.bind_addr(addr);
    }
    if std::env::var(ENV_LENIENT).is_ok_and(|value| value != "0") {
        config = config.strict_sessions(false);
    }

    #[cfg(feature = "sqlite")]
    if let Ok(url) = std::env::var(ENV_DB) {
        use pelican_store::{SqliteStore, connection_pool, create_database, run_pending_migrations};

        create_database(&url).await?;
        let pool = connection_pool(&url, 16).await?;
        run_pending_migrations(&pool).await?;

        info!("serving from sqlite store at {url}");
        pelican_server::serve(SqliteStore::new(pool), config).await?;
        return Ok(());
    }

    info!("serving from in-memory store");
    pelican_server::serve(pelican_store::MemoryStore::new(), config).await?;
    Ok(())
}
