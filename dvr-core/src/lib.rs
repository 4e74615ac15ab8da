pub mod config;
pub mod daily;
pub mod error;
pub mod media;
pub mod merger;
pub mod pipeline;
pub mod retention;
pub mod segment;
mod sqlite;

pub use config::{
    load_dvr_config, DvrConfig, MergeSection, RecordingSection, StorageSection, ToolsSection,
};
pub use daily::{
    AggregateState, ArtifactRecord, DailyAggregate, DailyError, DailyStore, DailyStoreBuilder,
};
pub use error::{ConfigError, Result};
pub use media::{
    CommandExecutor, MediaError, MediaTools, SystemCommandExecutor, MIN_VALID_SIZE_BYTES,
};
pub use merger::{MergeCoordinator, MergeError, MergeOutcome, MergeSettings};
pub use pipeline::{DailyView, PipelineError, PipelineStats, RecordingPipeline};
pub use retention::{RetentionError, RetentionReport, RetentionSweeper};
pub use segment::{
    NewSegment, Segment, SegmentError, SegmentState, SegmentStore, SegmentStoreBuilder,
};
