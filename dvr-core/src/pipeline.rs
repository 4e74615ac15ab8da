use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::DvrConfig;
use crate::daily::{AggregateState, DailyAggregate, DailyError, DailyStore};
use crate::media::{CommandExecutor, MediaTools};
use crate::merger::{MergeCoordinator, MergeSettings};
use crate::retention::{RetentionError, RetentionReport, RetentionSweeper};
use crate::segment::{NewSegment, Segment, SegmentError, SegmentStore};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("segment store error: {0}")]
    Segments(#[from] SegmentError),
    #[error("daily store error: {0}")]
    Daily(#[from] DailyError),
    #[error("retention error: {0}")]
    Retention(#[from] RetentionError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Read model handed to query callers. The public URL carries a
/// cache-busting marker derived from the last update, so downstream caches
/// refetch after a re-merge of the same date.
#[derive(Debug, Clone, Serialize)]
pub struct DailyView {
    pub id: i64,
    pub recording_date: NaiveDate,
    pub title: String,
    pub public_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<i64>,
    pub segment_count: i64,
    pub state: AggregateState,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DailyView {
    fn from_aggregate(aggregate: DailyAggregate) -> Self {
        let public_url = aggregate.public_url.map(|url| match aggregate.updated_at {
            Some(updated) => format!("{url}?v={}", updated.timestamp()),
            None => url,
        });
        Self {
            id: aggregate.id,
            recording_date: aggregate.recording_date,
            title: aggregate.title,
            public_url,
            thumbnail_url: aggregate.thumbnail_url,
            duration_seconds: aggregate.duration_seconds,
            size_bytes: aggregate.size_bytes,
            segment_count: aggregate.segment_count,
            state: aggregate.state,
            created_at: aggregate.created_at,
            updated_at: aggregate.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub segments_by_state: HashMap<String, i64>,
    pub aggregates_by_state: HashMap<String, i64>,
}

/// The single surface external collaborators call. Relay callbacks, admin
/// actions, schedulers and query handlers all go through here.
#[derive(Clone)]
pub struct RecordingPipeline {
    segments: SegmentStore,
    daily: DailyStore,
    coordinator: MergeCoordinator,
    sweeper: RetentionSweeper,
    title_template: String,
    retention_days: u32,
}

impl RecordingPipeline {
    pub fn new(
        config: &DvrConfig,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> PipelineResult<Self> {
        if let Err(err) = std::fs::create_dir_all(&config.storage.data_dir) {
            tracing::warn!(dir = %config.storage.data_dir, error = %err, "could not create data dir");
        }
        let segments = SegmentStore::builder()
            .path(config.segments_db_path())
            .build()?;
        segments.initialize()?;
        let daily = DailyStore::builder().path(config.daily_db_path()).build()?;
        daily.initialize()?;

        let mut media = MediaTools::new(&config.tools);
        if let Some(executor) = executor {
            media = media.with_executor(executor);
        }
        let coordinator = MergeCoordinator::new(
            segments.clone(),
            daily.clone(),
            media,
            MergeSettings::from_config(config),
        );
        let sweeper = RetentionSweeper::new(
            segments.clone(),
            daily.clone(),
            PathBuf::from(&config.recording.output_dir),
        );

        Ok(Self {
            segments,
            daily,
            coordinator,
            sweeper,
            title_template: config.recording.title_template.clone(),
            retention_days: config.recording.retention_days,
        })
    }

    /// Register a finalized relay segment. The calendar date comes from the
    /// ISO component embedded in the path, falling back to today. Never
    /// triggers a merge.
    pub fn ingest(&self, app: &str, stream_key: &str, file_path: &str) -> PipelineResult<Segment> {
        let recording_date = extract_date(file_path).unwrap_or_else(today);
        // count+1 can race across independent writers; duplicate orders for
        // a date are accepted rather than guarded against.
        let segment_order = self.segments.count_for_date(recording_date)? + 1;
        let size_bytes = std::fs::metadata(file_path).ok().map(|m| m.len() as i64);

        let segment = self.segments.insert(&NewSegment {
            recording_date,
            stream_key: stream_key.to_string(),
            app_name: app.to_string(),
            file_path: file_path.to_string(),
            segment_order,
            size_bytes,
        })?;
        info!(
            app,
            stream = stream_key,
            %recording_date,
            order = segment_order,
            file = file_path,
            "segment registered"
        );

        self.daily
            .ensure_for_date(recording_date, &self.derive_title(recording_date))?;
        Ok(segment)
    }

    /// Relay reported stream stop: finalize everything still recording for
    /// the stream on that date.
    pub fn mark_segments_complete(
        &self,
        stream_key: &str,
        date: NaiveDate,
    ) -> PipelineResult<usize> {
        let completed = self.segments.complete_recording(stream_key, date)?;
        if completed > 0 {
            info!(stream = stream_key, %date, completed, "segments marked complete");
        }
        Ok(completed)
    }

    /// Per-file completion callback; records the final size when the file
    /// is readable.
    pub fn mark_segment_complete(&self, file_path: &str) -> PipelineResult<bool> {
        let size_bytes = std::fs::metadata(file_path).ok().map(|m| m.len() as i64);
        Ok(self.segments.complete_by_path(file_path, size_bytes)?)
    }

    /// Fire-and-forget merge trigger; completion is observable only through
    /// the aggregate's state.
    pub fn trigger_merge(&self, date: NaiveDate) {
        self.coordinator.request_merge(date);
    }

    pub fn is_merging(&self, date: NaiveDate) -> bool {
        self.coordinator.is_merging(date)
    }

    /// READY aggregates inside the retention window, newest first.
    pub fn get_recent(&self) -> PipelineResult<Vec<DailyView>> {
        let cutoff = today() - Duration::days(i64::from(self.retention_days));
        let views = self
            .daily
            .recent_ready(cutoff)?
            .into_iter()
            .map(DailyView::from_aggregate)
            .collect();
        Ok(views)
    }

    pub fn get_by_date(&self, date: NaiveDate) -> PipelineResult<Option<DailyView>> {
        let view = self
            .daily
            .fetch_by_date(date)?
            .filter(|aggregate| aggregate.state == AggregateState::Ready)
            .map(DailyView::from_aggregate);
        Ok(view)
    }

    pub fn delete_by_date(&self, date: NaiveDate) -> PipelineResult<bool> {
        Ok(self.sweeper.delete_by_date(date)?)
    }

    /// Scheduled retention sweep over everything past the window.
    pub fn cleanup(&self) -> PipelineResult<RetentionReport> {
        let cutoff = today() - Duration::days(i64::from(self.retention_days));
        Ok(self.sweeper.delete_older_than(cutoff)?)
    }

    pub fn stats(&self) -> PipelineResult<PipelineStats> {
        Ok(PipelineStats {
            segments_by_state: self.segments.counts_by_state()?,
            aggregates_by_state: self.daily.counts_by_state()?,
        })
    }

    fn derive_title(&self, date: NaiveDate) -> String {
        self.title_template
            .replace("{date}", &date.format("%d/%m/%Y").to_string())
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Pull the first `YYYY-MM-DD` path component out of a relay file path,
/// e.g. `.../live/stream/2025-12-10/1733820000.flv`.
fn extract_date(file_path: &str) -> Option<NaiveDate> {
    let pattern = Regex::new(r"^\d{4}-\d{2}-\d{2}$").ok()?;
    file_path
        .split(['/', '\\'])
        .find(|component| pattern.is_match(component))
        .and_then(|component| NaiveDate::parse_from_str(component, "%Y-%m-%d").ok())
}

#[cfg(test)]
mod tests {
    use super::extract_date;
    use chrono::NaiveDate;

    #[test]
    fn extracts_date_component_from_path() {
        let date = extract_date("./objs/nginx/html/recordings/live/main/2025-12-10/1733820000.flv");
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 12, 10));
    }

    #[test]
    fn ignores_paths_without_date_component() {
        assert_eq!(extract_date("/recordings/live/main/part1.flv"), None);
        // Embedded in a larger component does not count; the date must be a
        // whole path segment.
        assert_eq!(extract_date("/recordings/2025-12-10T subdir/file.flv"), None);
    }
}
