use std::{
    io,
    path::{Path, PathBuf},
    str::FromStr,
    time::SystemTime,
};

use async_trait::async_trait;
use sqlx::{
    ConnectOptions,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous},
};
use tracing::debug;

use crate::store::Storage;

/// Key/value storage in a single sqlite file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    inner: SqlitePool,
    // None for an in-memory db
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// opens (or creates) the db file at `path`
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        // rollback journal so the file mtime tracks the last committed write
        let mut opts = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);
        // make sqlite log queries at trace level so we don't get a bloated log on `info`
        opts.log_statements(tracing::log::LevelFilter::Trace);
        let inner = Self::connect(opts).await?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            inner,
            path: Some(path.to_owned()),
        })
    }

    /// a store that lives as long as this value, it has no modification time
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let mut opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        opts.log_statements(tracing::log::LevelFilter::Trace);
        let inner = Self::connect(opts).await?;
        Ok(Self { inner, path: None })
    }

    async fn connect(opts: SqliteConnectOptions) -> Result<SqlitePool, sqlx::Error> {
        // a single connection that never closes, in memory sqlite would
        // otherwise drop the db with its last connection
        let inner = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS ipam_state (key TEXT PRIMARY KEY NOT NULL, value BLOB NOT NULL)")
            .execute(&inner)
            .await?;
        Ok(inner)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[async_trait]
impl Storage for SqliteStore {
    type Error = sqlx::Error;

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM ipam_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.inner)
            .await
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        sqlx::query(
            "INSERT INTO ipam_state (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.inner)
        .await?;
        Ok(())
    }

    async fn modification_time(&self) -> Result<SystemTime, Self::Error> {
        match &self.path {
            Some(path) => Ok(tokio::fs::metadata(path).await?.modified()?),
            None => Err(sqlx::Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "in-memory store has no modification time",
            ))),
        }
    }
}
