use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use dvr_core::{load_dvr_config, DailyView, DvrConfig, RecordingPipeline};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] dvr_core::ConfigError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] dvr_core::PipelineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no ready recording for {0}")]
    NotFound(NaiveDate),
    #[error("merge for {0} did not produce a ready recording")]
    MergeFailed(NaiveDate),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Operator interface for the daily recording pipeline", long_about = None)]
pub struct Cli {
    /// Path to dvr.toml
    #[arg(long, default_value = "configs/dvr.toml")]
    pub config: PathBuf,
    /// Override for the directory holding the sqlite stores
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show segment and aggregate counters
    Status,
    /// Register a finalized relay segment (relay hook scripts)
    Ingest(IngestArgs),
    /// Finalize a stream's segments for a date (relay stop hook)
    Complete(CompleteArgs),
    /// Merge a date's segments and wait for the outcome
    Merge(MergeArgs),
    /// Query and manage daily recordings
    #[command(subcommand)]
    Recordings(RecordingCommands),
    /// Delete recordings past the retention window
    Cleanup,
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Relay application name
    #[arg(long, default_value = "live")]
    pub app: String,
    /// Stream key the segment belongs to
    #[arg(long)]
    pub stream: String,
    /// Path of the finalized segment file
    pub file: String,
}

#[derive(Args, Debug)]
pub struct CompleteArgs {
    #[arg(long)]
    pub stream: String,
    pub date: NaiveDate,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    pub date: NaiveDate,
}

#[derive(Subcommand, Debug)]
pub enum RecordingCommands {
    /// READY recordings inside the retention window, newest first
    List,
    /// Show a single date
    Show(ShowArgs),
    /// Delete a date's artifact and segments
    Delete(ShowArgs),
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub date: NaiveDate,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = load_dvr_config(&cli.config)?;
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.to_string_lossy().to_string();
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(cli, config))
}

async fn dispatch(cli: Cli, config: DvrConfig) -> Result<()> {
    let pipeline = RecordingPipeline::new(&config, None)?;
    let format = cli.format;
    match cli.command {
        Commands::Status => {
            let stats = pipeline.stats()?;
            emit(format, &stats, |stats| {
                let mut out = String::from("segments:\n");
                for (state, count) in &stats.segments_by_state {
                    out.push_str(&format!("  {state}: {count}\n"));
                }
                out.push_str("daily recordings:\n");
                for (state, count) in &stats.aggregates_by_state {
                    out.push_str(&format!("  {state}: {count}\n"));
                }
                out
            })
        }
        Commands::Ingest(args) => {
            let segment = pipeline.ingest(&args.app, &args.stream, &args.file)?;
            emit(format, &segment, |segment| {
                format!(
                    "registered segment {} for {} (order {})",
                    segment.id, segment.recording_date, segment.segment_order
                )
            })
        }
        Commands::Complete(args) => {
            let completed = pipeline.mark_segments_complete(&args.stream, args.date)?;
            emit(format, &completed, |count| {
                format!("finalized {count} segment(s) for {}", args.date)
            })
        }
        Commands::Merge(args) => {
            pipeline.trigger_merge(args.date);
            while pipeline.is_merging(args.date) {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            match pipeline.get_by_date(args.date)? {
                Some(view) => emit(format, &view, render_view),
                None => Err(AppError::MergeFailed(args.date)),
            }
        }
        Commands::Recordings(RecordingCommands::List) => {
            let views = pipeline.get_recent()?;
            emit(format, &views, |views| {
                if views.is_empty() {
                    return "no recordings in the retention window".to_string();
                }
                views.iter().map(render_view).collect::<Vec<_>>().join("\n")
            })
        }
        Commands::Recordings(RecordingCommands::Show(args)) => {
            let view = pipeline
                .get_by_date(args.date)?
                .ok_or(AppError::NotFound(args.date))?;
            emit(format, &view, render_view)
        }
        Commands::Recordings(RecordingCommands::Delete(args)) => {
            if !pipeline.delete_by_date(args.date)? {
                return Err(AppError::NotFound(args.date));
            }
            emit(format, &args.date, |date| format!("deleted recording for {date}"))
        }
        Commands::Cleanup => {
            let report = pipeline.cleanup()?;
            emit(format, &report, |report| {
                format!(
                    "deleted {} daily recording(s) and {} segment(s)",
                    report.aggregates_deleted, report.segments_deleted
                )
            })
        }
    }
}

fn render_view(view: &DailyView) -> String {
    let duration = view
        .duration_seconds
        .map(|s| format!("{s}s"))
        .unwrap_or_else(|| "-".to_string());
    let url = view.public_url.as_deref().unwrap_or("-");
    format!(
        "{}  {}  {} segment(s)  {}  {}  {}",
        view.recording_date, view.state, view.segment_count, duration, view.title, url
    )
}

fn emit<T, F>(format: OutputFormat, value: &T, text: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{}", text(value)),
    }
    Ok(())
}
