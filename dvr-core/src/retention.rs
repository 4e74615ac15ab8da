use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::daily::{AggregateState, DailyAggregate, DailyError, DailyStore};
use crate::segment::{SegmentError, SegmentState, SegmentStore};

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("segment store error: {0}")]
    Segments(#[from] SegmentError),
    #[error("daily store error: {0}")]
    Daily(#[from] DailyError),
}

pub type RetentionResult<T> = Result<T, RetentionError>;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetentionReport {
    pub aggregates_deleted: usize,
    pub segments_deleted: usize,
}

/// Removes aggregates and segments that have aged out of the retention
/// window. File removal is best-effort per row; the sweep is resumable
/// because deleting an already-missing file is a no-op.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    segments: SegmentStore,
    daily: DailyStore,
    output_dir: PathBuf,
}

impl RetentionSweeper {
    pub fn new(segments: SegmentStore, daily: DailyStore, output_dir: PathBuf) -> Self {
        Self {
            segments,
            daily,
            output_dir,
        }
    }

    pub fn delete_older_than(&self, cutoff: NaiveDate) -> RetentionResult<RetentionReport> {
        info!(%cutoff, "removing recordings older than cutoff");
        let mut report = RetentionReport::default();

        for aggregate in self.daily.older_than(cutoff)? {
            self.remove_aggregate_files(&aggregate);
            self.daily
                .update_state(aggregate.recording_date, AggregateState::Deleted)?;
            report.aggregates_deleted += 1;
        }

        for segment in self.segments.older_than(cutoff)? {
            remove_file_logged(Path::new(&segment.file_path));
            self.segments
                .update_state(segment.id, SegmentState::Deleted)?;
            report.segments_deleted += 1;
        }

        info!(
            aggregates = report.aggregates_deleted,
            segments = report.segments_deleted,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Single-date deletion for admin use. Returns whether an aggregate row
    /// existed for the date.
    pub fn delete_by_date(&self, date: NaiveDate) -> RetentionResult<bool> {
        let Some(aggregate) = self.daily.fetch_by_date(date)? else {
            warn!(%date, "no daily aggregate to delete");
            return Ok(false);
        };

        self.remove_aggregate_files(&aggregate);
        self.daily.update_state(date, AggregateState::Deleted)?;

        for segment in self.segments.list_for_date(date)? {
            if segment.state == SegmentState::Deleted {
                continue;
            }
            remove_file_logged(Path::new(&segment.file_path));
            self.segments
                .update_state(segment.id, SegmentState::Deleted)?;
        }

        info!(%date, "recording deleted");
        Ok(true)
    }

    fn remove_aggregate_files(&self, aggregate: &DailyAggregate) {
        if let Some(path) = &aggregate.artifact_path {
            remove_file_logged(Path::new(path));
        }
        let thumbnail = self
            .output_dir
            .join("thumbnails")
            .join(format!("{}.jpg", aggregate.recording_date));
        remove_file_logged(&thumbnail);
    }
}

fn remove_file_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "deleted file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to delete file"),
    }
}
