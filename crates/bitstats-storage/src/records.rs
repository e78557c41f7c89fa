//! Append-only sinks for stats records: the SQLite `links` table and a JSON-lines writer.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use bitstats_core::StatsRecord;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::StorageError;

const CREATE_LINKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS links (
    host TEXT NOT NULL,
    path TEXT NOT NULL,
    date TEXT NOT NULL,
    link TEXT NOT NULL,
    url TEXT NOT NULL,
    clicks INTEGER NOT NULL,
    utm_source TEXT NOT NULL DEFAULT '',
    utm_medium TEXT NOT NULL DEFAULT '',
    utm_campaign TEXT NOT NULL DEFAULT '',
    utm_term TEXT NOT NULL DEFAULT '',
    utm_content TEXT NOT NULL DEFAULT ''
)
"#;

const INSERT_LINK: &str = "insert into links (host, path, date, link, url, clicks, utm_source, utm_medium, utm_campaign, utm_term, utm_content) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn insert(&self, record: &StatsRecord) -> Result<(), StorageError>;
}

/// Clicks per day and short link, as rendered by reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct DailyTotal {
    pub day: String,
    pub link: String,
    pub host: String,
    pub path: String,
    pub utm_campaign: String,
    pub clicks: i64,
}

/// The downloaded data file. The pool holds a single connection so inserts are
/// serialized; each insert commits its own transaction.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteRecordStore {
    /// Open an existing data file. A missing file is an error; schema is not touched.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let exists = tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("checking database path {}", path.display()))?;
        if !exists {
            return Err(StorageError::MissingDatabase(path.display().to_string()));
        }
        Self::connect(path, false).await
    }

    /// Create the data file and the `links` table if either is missing.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let store = Self::connect(path, true).await?;
        sqlx::query(CREATE_LINKS_TABLE).execute(&store.pool).await?;
        Ok(store)
    }

    async fn connect(path: &Path, create_if_missing: bool) -> Result<Self, StorageError> {
        // Rollback journal keeps every committed row inside the single file we upload.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create_if_missing)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn daily_totals(&self, since_day: &str) -> Result<Vec<DailyTotal>, StorageError> {
        let rows = sqlx::query_as::<_, DailyTotal>(
            r#"
            SELECT substr(date, 1, 10) AS day, link, host, path, utm_campaign,
                   CAST(SUM(clicks) AS INTEGER) AS clicks
            FROM links
            WHERE substr(date, 1, 10) >= ?
            GROUP BY day, link, host, path, utm_campaign
            ORDER BY day DESC, clicks DESC, link ASC
            "#,
        )
        .bind(since_day)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordSink for SqliteRecordStore {
    async fn insert(&self, record: &StatsRecord) -> Result<(), StorageError> {
        let clicks = i64::try_from(record.clicks)
            .with_context(|| format!("click count {} out of range", record.clicks))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(INSERT_LINK)
            .bind(&record.host)
            .bind(&record.path)
            .bind(&record.date)
            .bind(&record.link)
            .bind(&record.url)
            .bind(clicks)
            .bind(&record.utm_source)
            .bind(&record.utm_medium)
            .bind(&record.utm_campaign)
            .bind(&record.utm_term)
            .bind(&record.utm_content)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(link = %record.link, date = %record.date, clicks, "record inserted");
        Ok(())
    }
}

/// Writes each record as one JSON line instead of persisting it.
pub struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    async fn insert(&self, record: &StatsRecord) -> Result<(), StorageError> {
        let line = serde_json::to_string(record).context("serializing stats record")?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("record writer lock poisoned"))?;
        writeln!(out, "{line}").context("writing stats record")?;
        Ok(())
    }
}
