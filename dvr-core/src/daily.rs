use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sqlite::configure_connection;

const DAILY_SCHEMA: &str = include_str!("../../sql/daily.sql");

#[derive(Debug, Error)]
pub enum DailyError {
    #[error("failed to open daily database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("daily database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("daily store path not configured")]
    MissingStore,
    #[error("no daily aggregate for {date}")]
    NotFound { date: NaiveDate },
    #[error("invalid aggregate state: {0}")]
    InvalidState(String),
}

pub type DailyResult<T> = Result<T, DailyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    Pending,
    Processing,
    Ready,
    Failed,
    Deleted,
}

impl AggregateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateState::Pending => "pending",
            AggregateState::Processing => "processing",
            AggregateState::Ready => "ready",
            AggregateState::Failed => "failed",
            AggregateState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for AggregateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateState {
    type Err = DailyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(DailyError::InvalidState(other.to_string())),
        }
    }
}

/// One merged artifact per calendar day. The row exists from the first
/// ingested segment onwards; the artifact fields fill in after a merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub id: i64,
    pub recording_date: NaiveDate,
    pub title: String,
    pub artifact_path: Option<String>,
    pub public_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<i64>,
    pub segment_count: i64,
    pub state: AggregateState,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DailyAggregate {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            id: row.get("id")?,
            recording_date: row.get("recording_date")?,
            title: row.get("title")?,
            artifact_path: row.get("artifact_path")?,
            public_url: row.get("public_url")?,
            thumbnail_url: row.get("thumbnail_url")?,
            duration_seconds: row.get("duration_seconds")?,
            size_bytes: row.get("size_bytes")?,
            segment_count: row.get::<_, Option<i64>>("segment_count")?.unwrap_or(0),
            state: row
                .get::<_, String>("state")?
                .parse()
                .unwrap_or(AggregateState::Pending),
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

/// Artifact fields written when a merge completes.
#[derive(Debug, Clone)]
pub struct ArtifactRecord<'a> {
    pub artifact_path: &'a str,
    pub public_url: &'a str,
    pub thumbnail_url: &'a str,
    pub duration_seconds: i64,
    pub size_bytes: i64,
    pub segment_count: i64,
}

#[derive(Debug, Clone)]
pub struct DailyStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for DailyStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl DailyStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> DailyResult<DailyStore> {
        let path = self.path.ok_or(DailyError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(DailyStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct DailyStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl DailyStore {
    pub fn builder() -> DailyStoreBuilder {
        DailyStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> DailyResult<Self> {
        DailyStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> DailyResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            DailyError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| DailyError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> DailyResult<()> {
        let conn = self.open()?;
        conn.execute_batch(DAILY_SCHEMA)?;
        Ok(())
    }

    /// Create the aggregate row for a date if it does not exist yet.
    /// Idempotent; an existing row keeps its title and state.
    pub fn ensure_for_date(&self, date: NaiveDate, title: &str) -> DailyResult<DailyAggregate> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR IGNORE INTO daily_recordings (recording_date, title, state)
             VALUES (?1, ?2, 'pending')",
            params![date, title],
        )?;
        let mut stmt = conn.prepare("SELECT * FROM daily_recordings WHERE recording_date = ?1")?;
        let aggregate = stmt.query_row([date], DailyAggregate::from_row)?;
        Ok(aggregate)
    }

    pub fn fetch_by_date(&self, date: NaiveDate) -> DailyResult<Option<DailyAggregate>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM daily_recordings WHERE recording_date = ?1")?;
        let aggregate = stmt
            .query_row([date], DailyAggregate::from_row)
            .optional()?;
        Ok(aggregate)
    }

    pub fn update_state(&self, date: NaiveDate, state: AggregateState) -> DailyResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE daily_recordings
             SET state = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE recording_date = ?1",
            params![date, state.as_str()],
        )?;
        if affected == 0 {
            return Err(DailyError::NotFound { date });
        }
        Ok(())
    }

    /// Publish a merged artifact: one update covering every artifact field
    /// plus the READY transition.
    pub fn finalize_ready(&self, date: NaiveDate, record: &ArtifactRecord<'_>) -> DailyResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE daily_recordings
             SET artifact_path = ?2,
                 public_url = ?3,
                 thumbnail_url = ?4,
                 duration_seconds = ?5,
                 size_bytes = ?6,
                 segment_count = ?7,
                 state = 'ready',
                 updated_at = CURRENT_TIMESTAMP
             WHERE recording_date = ?1",
            params![
                date,
                record.artifact_path,
                record.public_url,
                record.thumbnail_url,
                record.duration_seconds,
                record.size_bytes,
                record.segment_count,
            ],
        )?;
        if affected == 0 {
            return Err(DailyError::NotFound { date });
        }
        Ok(())
    }

    /// READY aggregates newer than the cutoff, newest first.
    pub fn recent_ready(&self, cutoff: NaiveDate) -> DailyResult<Vec<DailyAggregate>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM daily_recordings
             WHERE state = 'ready' AND recording_date > ?1
             ORDER BY recording_date DESC",
        )?;
        let rows = stmt
            .query_map([cutoff], DailyAggregate::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn older_than(&self, cutoff: NaiveDate) -> DailyResult<Vec<DailyAggregate>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM daily_recordings
             WHERE recording_date < ?1 AND state != 'deleted'
             ORDER BY recording_date ASC",
        )?;
        let rows = stmt
            .query_map([cutoff], DailyAggregate::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn counts_by_state(&self) -> DailyResult<HashMap<String, i64>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM daily_recordings GROUP BY state")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (state, count) = row?;
            map.insert(state, count);
        }
        Ok(map)
    }
}
