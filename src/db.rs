use std::path::Path;
use std::str::FromStr;

use ragweave_core::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub const DB_FILE: &str = "store.sqlite";

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::store("sqlite", e)
}

/// Open (creating if needed) the SQLite database at `path` in WAL mode.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .map_err(db_err)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(db_err)
}
