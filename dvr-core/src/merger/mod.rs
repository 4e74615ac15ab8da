mod error;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::DvrConfig;
use crate::daily::{AggregateState, ArtifactRecord, DailyStore};
use crate::media::MediaTools;
use crate::segment::{Segment, SegmentState, SegmentStore};

pub use error::{MergeError, MergeResult};

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub output_dir: PathBuf,
    pub video_url_base: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl MergeSettings {
    pub fn from_config(config: &DvrConfig) -> Self {
        Self {
            output_dir: PathBuf::from(&config.recording.output_dir),
            video_url_base: config.recording.video_url_base.clone(),
            max_attempts: config.merge.max_attempts.max(1),
            retry_delay: Duration::from_secs(config.merge.retry_delay_seconds),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub date: NaiveDate,
    pub artifact_path: PathBuf,
    pub duration_seconds: i64,
    pub size_bytes: i64,
    pub segment_count: usize,
}

/// Serializes merges per calendar date. Distinct dates merge in parallel on
/// spawned tasks; a date already merging turns further triggers into no-ops.
#[derive(Clone)]
pub struct MergeCoordinator {
    segments: SegmentStore,
    daily: DailyStore,
    media: MediaTools,
    settings: MergeSettings,
    merging: Arc<Mutex<HashSet<NaiveDate>>>,
}

/// Releases a date's slot in the merging set whenever the merge task exits,
/// including panics.
struct MergeSlot {
    merging: Arc<Mutex<HashSet<NaiveDate>>>,
    date: NaiveDate,
}

impl Drop for MergeSlot {
    fn drop(&mut self) {
        self.merging.lock().unwrap().remove(&self.date);
    }
}

impl MergeCoordinator {
    pub fn new(
        segments: SegmentStore,
        daily: DailyStore,
        media: MediaTools,
        settings: MergeSettings,
    ) -> Self {
        Self {
            segments,
            daily,
            media,
            settings,
            merging: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Fire-and-forget merge trigger. Returns immediately; progress is
    /// observable through the aggregate's state. Must be called from within
    /// a tokio runtime.
    pub fn request_merge(&self, date: NaiveDate) {
        if !self.merging.lock().unwrap().insert(date) {
            warn!(%date, "merge already in progress, ignoring duplicate trigger");
            return;
        }
        let coordinator = self.clone();
        tokio::spawn(async move {
            let _slot = MergeSlot {
                merging: Arc::clone(&coordinator.merging),
                date,
            };
            coordinator.run(date).await;
        });
    }

    /// Whether a merge task currently holds the slot for `date`.
    pub fn is_merging(&self, date: NaiveDate) -> bool {
        self.merging.lock().unwrap().contains(&date)
    }

    async fn run(&self, date: NaiveDate) {
        match self.daily.fetch_by_date(date) {
            Ok(Some(aggregate)) => {
                if aggregate.state == AggregateState::Processing {
                    warn!(%date, "aggregate already processing, skipping");
                    return;
                }
                if aggregate.state == AggregateState::Ready && aggregate.artifact_path.is_some() {
                    info!(%date, "daily artifact already merged, nothing to do");
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!(%date, error = %err, "failed to load daily aggregate");
                return;
            }
        }

        for attempt in 1..=self.settings.max_attempts {
            info!(%date, attempt, max = self.settings.max_attempts, "merge attempt starting");
            match self.attempt(date).await {
                Ok(outcome) => {
                    info!(
                        %date,
                        attempt,
                        segments = outcome.segment_count,
                        artifact = %outcome.artifact_path.display(),
                        "merge completed"
                    );
                    return;
                }
                Err(err) if err.is_terminal() => {
                    error!(%date, error = %err, "merge aborted");
                    return;
                }
                Err(err) => {
                    error!(%date, attempt, error = %err, "merge attempt failed");
                    if attempt < self.settings.max_attempts {
                        warn!(
                            %date,
                            delay_secs = self.settings.retry_delay.as_secs(),
                            "retrying merge after delay"
                        );
                        sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }
        error!(%date, attempts = self.settings.max_attempts, "all merge attempts failed");
    }

    async fn attempt(&self, date: NaiveDate) -> MergeResult<MergeOutcome> {
        let segments = self.segments.ready_for_date(date)?;
        if segments.is_empty() {
            return Err(MergeError::NoReadySegments { date });
        }
        if self.daily.fetch_by_date(date)?.is_none() {
            return Err(MergeError::AggregateNotFound { date });
        }
        self.daily.update_state(date, AggregateState::Processing)?;

        match self.merge_once(date, &segments).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(store_err) = self.daily.update_state(date, AggregateState::Failed) {
                    error!(%date, error = %store_err, "failed to record merge failure");
                }
                Err(err)
            }
        }
    }

    async fn merge_once(&self, date: NaiveDate, segments: &[Segment]) -> MergeResult<MergeOutcome> {
        let daily_dir = self.settings.output_dir.join("daily");
        let thumbs_dir = self.settings.output_dir.join("thumbnails");
        for dir in [&daily_dir, &thumbs_dir] {
            fs::create_dir_all(dir).map_err(|source| MergeError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        let output = daily_dir.join(format!("{date}.mp4"));
        let backup = daily_dir.join(format!("{date}.mp4.bak"));

        // Preserve the last published artifact so a failed re-merge cannot
        // destroy it.
        if output.exists() {
            match fs::copy(&output, &backup) {
                Ok(_) => info!(backup = %backup.display(), "backed up existing artifact"),
                Err(err) => {
                    warn!(backup = %backup.display(), error = %err, "failed to back up artifact")
                }
            }
        }

        let inputs: Vec<PathBuf> = segments
            .iter()
            .map(|segment| PathBuf::from(&segment.file_path))
            .collect();
        self.media.concat(&inputs, &output).await?;

        if !self.media.validate(&output).await {
            self.restore_backup(&backup, &output);
            return Err(MergeError::Validation { path: output });
        }

        let duration_seconds = self.media.probe_duration(&output).await;
        let size_bytes = fs::metadata(&output).map(|m| m.len() as i64).unwrap_or(0);
        let file_name = format!("{date}.mp4");
        let public_url = format!("{}/daily/{file_name}", self.settings.video_url_base);

        let thumbnail = thumbs_dir.join(format!("{date}.jpg"));
        self.media.generate_thumbnail(&output, &thumbnail).await;
        let thumbnail_url = format!("{}/thumbnails/{date}.jpg", self.settings.video_url_base);

        let artifact_path = output.to_string_lossy();
        self.daily.finalize_ready(
            date,
            &ArtifactRecord {
                artifact_path: &artifact_path,
                public_url: &public_url,
                thumbnail_url: &thumbnail_url,
                duration_seconds,
                size_bytes,
                segment_count: segments.len() as i64,
            },
        )?;

        for segment in segments {
            self.segments
                .update_state(segment.id, SegmentState::Merged)?;
            remove_file_logged(Path::new(&segment.file_path), "raw segment");
        }
        remove_file_logged(&backup, "artifact backup");

        Ok(MergeOutcome {
            date,
            artifact_path: output,
            duration_seconds,
            size_bytes,
            segment_count: segments.len(),
        })
    }

    fn restore_backup(&self, backup: &Path, output: &Path) {
        if !backup.exists() {
            return;
        }
        match fs::copy(backup, output) {
            Ok(_) => info!(artifact = %output.display(), "restored backup after failed validation"),
            Err(err) => {
                error!(artifact = %output.display(), error = %err, "failed to restore backup")
            }
        }
    }
}

/// Row state is the source of truth; a missing or undeletable file only
/// warrants a log line.
fn remove_file_logged(path: &Path, label: &str) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed {label}"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove {label}"),
    }
}
