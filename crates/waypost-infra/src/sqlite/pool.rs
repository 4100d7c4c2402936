//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. Commits, registration updates and
//! outbox claims all go through the single-connection `writer` pool, which
//! also serializes them; reads use the multi-connection `reader` pool.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "WAYPOST_DATA_DIR";

const DATABASE_FILE: &str = "waypost.db";

/// Split read/write pool for SQLite with WAL mode.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools and run migrations on the writer.
    ///
    /// Both pools use WAL journal mode, foreign key enforcement and a 5-second
    /// busy timeout.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_reader_connections(database_url, 8).await
    }

    pub async fn with_reader_connections(
        database_url: &str,
        reader_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts)
            .await?;

        // Schema must exist before read-only connections open.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(reader_connections.max(1))
            .connect_with(read_opts)
            .await?;

        tracing::debug!(database_url, reader_connections, "database pool opened");
        Ok(Self { reader, writer })
    }

    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

/// Data directory: `WAYPOST_DATA_DIR`, else `~/.waypost`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".waypost"),
    }
}

/// Database URL for a file inside `data_dir`.
pub fn database_url_in(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join(DATABASE_FILE).display())
}

/// Database URL inside [`default_data_dir`].
pub fn default_database_url() -> String {
    database_url_in(&default_data_dir())
}
