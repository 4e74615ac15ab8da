use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sqlite::configure_connection;

const SEGMENT_SCHEMA: &str = include_str!("../../sql/segments.sql");

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("failed to open segment database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("segment database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("segment store path not configured")]
    MissingStore,
    #[error("segment {id} not found")]
    NotFound { id: i64 },
    #[error("invalid segment state: {0}")]
    InvalidState(String),
}

pub type SegmentResult<T> = Result<T, SegmentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Recording,
    Ready,
    Processing,
    Merged,
    Failed,
    Deleted,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Recording => "recording",
            SegmentState::Ready => "ready",
            SegmentState::Processing => "processing",
            SegmentState::Merged => "merged",
            SegmentState::Failed => "failed",
            SegmentState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentState {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recording" => Ok(Self::Recording),
            "ready" => Ok(Self::Ready),
            "processing" => Ok(Self::Processing),
            "merged" => Ok(Self::Merged),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(SegmentError::InvalidState(other.to_string())),
        }
    }
}

/// Input for registering a freshly finalized relay segment.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub recording_date: NaiveDate,
    pub stream_key: String,
    pub app_name: String,
    pub file_path: String,
    pub segment_order: i64,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub recording_date: NaiveDate,
    pub stream_key: String,
    pub app_name: String,
    pub file_path: String,
    pub size_bytes: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub segment_order: i64,
    pub state: SegmentState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Segment {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let started_at: Option<NaiveDateTime> = row.get("started_at")?;
        let ended_at: Option<NaiveDateTime> = row.get("ended_at")?;
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        Ok(Self {
            id: row.get("id")?,
            recording_date: row.get("recording_date")?,
            stream_key: row.get("stream_key")?,
            app_name: row.get("app_name")?,
            file_path: row.get("file_path")?,
            size_bytes: row.get("size_bytes")?,
            duration_seconds: row.get("duration_seconds")?,
            segment_order: row.get("segment_order")?,
            state: row
                .get::<_, String>("state")?
                .parse()
                .unwrap_or(SegmentState::Ready),
            started_at: started_at.map(|dt| Utc.from_utc_datetime(&dt)),
            ended_at: ended_at.map(|dt| Utc.from_utc_datetime(&dt)),
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SegmentStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SegmentStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SegmentStoreBuilder {
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

    pub fn build(self) -> SegmentResult<SegmentStore> {
        let path = self.path.ok_or(SegmentError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SegmentStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SegmentStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SegmentStore {
    pub fn builder() -> SegmentStoreBuilder {
        SegmentStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SegmentResult<Self> {
        SegmentStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> SegmentResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SegmentError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| SegmentError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SegmentResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SEGMENT_SCHEMA)?;
        Ok(())
    }

    pub fn insert(&self, segment: &NewSegment) -> SegmentResult<Segment> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO segments (
                recording_date, stream_key, app_name, file_path, size_bytes,
                segment_order, state, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'ready', ?7)",
            params![
                segment.recording_date,
                &segment.stream_key,
                &segment.app_name,
                &segment.file_path,
                segment.size_bytes,
                segment.segment_order,
                Utc::now().naive_utc(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt = conn.prepare("SELECT * FROM segments WHERE id = ?1")?;
        let inserted = stmt.query_row([id], Segment::from_row)?;
        Ok(inserted)
    }

    pub fn fetch_by_id(&self, id: i64) -> SegmentResult<Option<Segment>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM segments WHERE id = ?1")?;
        let segment = stmt.query_row([id], Segment::from_row).optional()?;
        Ok(segment)
    }

    pub fn count_for_date(&self, date: NaiveDate) -> SegmentResult<i64> {
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM segments WHERE recording_date = ?1",
            [date],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Segments eligible for merging, in playback order.
    pub fn ready_for_date(&self, date: NaiveDate) -> SegmentResult<Vec<Segment>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM segments
             WHERE recording_date = ?1 AND state = 'ready'
             ORDER BY segment_order ASC",
        )?;
        let rows = stmt
            .query_map([date], Segment::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_for_date(&self, date: NaiveDate) -> SegmentResult<Vec<Segment>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM segments WHERE recording_date = ?1 ORDER BY segment_order ASC",
        )?;
        let rows = stmt
            .query_map([date], Segment::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_state(&self, id: i64, state: SegmentState) -> SegmentResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE segments SET state = ?2 WHERE id = ?1",
            params![id, state.as_str()],
        )?;
        if affected == 0 {
            return Err(SegmentError::NotFound { id });
        }
        Ok(())
    }

    /// Finalize every segment still marked `recording` for a stream/date.
    /// Returns how many rows were transitioned.
    pub fn complete_recording(&self, stream_key: &str, date: NaiveDate) -> SegmentResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE segments SET state = 'ready', ended_at = ?3
             WHERE stream_key = ?1 AND recording_date = ?2 AND state = 'recording'",
            params![stream_key, date, Utc::now().naive_utc()],
        )?;
        Ok(affected)
    }

    /// Finalize the single segment owning `file_path`, recording its size if
    /// known. No-op when the path is not registered.
    pub fn complete_by_path(&self, file_path: &str, size_bytes: Option<i64>) -> SegmentResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE segments
             SET state = 'ready', ended_at = ?2, size_bytes = COALESCE(?3, size_bytes)
             WHERE file_path = ?1 AND state IN ('recording', 'ready')",
            params![file_path, Utc::now().naive_utc(), size_bytes],
        )?;
        Ok(affected > 0)
    }

    pub fn older_than(&self, cutoff: NaiveDate) -> SegmentResult<Vec<Segment>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM segments
             WHERE recording_date < ?1 AND state != 'deleted'
             ORDER BY recording_date ASC, segment_order ASC",
        )?;
        let rows = stmt
            .query_map([cutoff], Segment::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn counts_by_state(&self) -> SegmentResult<HashMap<String, i64>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM segments GROUP BY state")?;
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
