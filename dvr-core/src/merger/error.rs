use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use crate::daily::DailyError;
use crate::media::MediaError;
use crate::segment::SegmentError;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no ready segments for {date}")]
    NoReadySegments { date: NaiveDate },
    #[error("no daily aggregate registered for {date}")]
    AggregateNotFound { date: NaiveDate },
    #[error("media tool failure: {0}")]
    Tool(#[from] MediaError),
    #[error("merged artifact failed validation: {path}")]
    Validation { path: PathBuf },
    #[error("segment store error: {0}")]
    Segments(#[from] SegmentError),
    #[error("daily store error: {0}")]
    Daily(#[from] DailyError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl MergeError {
    /// Input errors abort the whole merge; nothing about the input set will
    /// change between attempts, so retrying is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MergeError::NoReadySegments { .. } | MergeError::AggregateNotFound { .. }
        )
    }
}

pub type MergeResult<T> = Result<T, MergeError>;
