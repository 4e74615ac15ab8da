use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::ToolsSection;

/// Merged output below this size is treated as truncated regardless of what
/// the probe reports for duration.
pub const MIN_VALID_SIZE_BYTES: i64 = 1_000_000;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} exited with status {status:?}: {stderr}")]
    CommandFailure {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type MediaResult<T> = Result<T, MediaError>;

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

/// Thin wrapper over the ffmpeg/ffprobe pair. Stream-copy concat and a
/// coarse probe are the only operations the pipeline needs; everything
/// heavier stays outside this process.
#[derive(Clone)]
pub struct MediaTools {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for MediaTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTools")
            .field("ffmpeg", &self.ffmpeg)
            .field("ffprobe", &self.ffprobe)
            .finish()
    }
}

impl MediaTools {
    pub fn new(tools: &ToolsSection) -> Self {
        Self {
            ffmpeg: PathBuf::from(&tools.ffmpeg),
            ffprobe: PathBuf::from(&tools.ffprobe),
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Join the inputs into `output` without re-encoding. The concat list is
    /// a temporary file removed on drop, whatever the outcome.
    pub async fn concat(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<()> {
        let list = self.write_concat_list(inputs)?;
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(list.path())
            .arg("-c")
            .arg("copy")
            .arg("-movflags")
            .arg("+faststart")
            .arg(output);
        let result = self.run_tool(&self.ffmpeg, &mut command).await?;
        if !result.status.success() {
            return Err(MediaError::CommandFailure {
                tool: self.ffmpeg.display().to_string(),
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).to_string(),
            });
        }
        info!(
            output = %output.display(),
            inputs = inputs.len(),
            "concat completed"
        );
        Ok(())
    }

    /// Coarse corruption guard: duration must be positive and the file must
    /// clear a fixed size floor. Any probe failure counts as invalid.
    pub async fn validate(&self, path: &Path) -> bool {
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("format=duration,size")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path);
        let output = match self.run_tool(&self.ffprobe, &mut command).await {
            Ok(output) => output,
            Err(err) => {
                error!(path = %path.display(), error = %err, "validation probe failed");
                return false;
            }
        };
        if !output.status.success() {
            error!(
                path = %path.display(),
                status = ?output.status.code(),
                "validation probe exited with error"
            );
            return false;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let duration = lines.next().and_then(|line| line.trim().parse::<f64>().ok());
        let size = lines.next().and_then(|line| line.trim().parse::<i64>().ok());
        match (duration, size) {
            (Some(duration), Some(size)) if duration > 0.0 && size >= MIN_VALID_SIZE_BYTES => {
                info!(path = %path.display(), seconds = duration, bytes = size, "artifact validated");
                true
            }
            (Some(duration), Some(size)) => {
                error!(
                    path = %path.display(),
                    seconds = duration,
                    bytes = size,
                    "artifact failed sanity check"
                );
                false
            }
            _ => {
                error!(path = %path.display(), probe = %stdout.trim(), "unreadable probe output");
                false
            }
        }
    }

    /// Best-effort duration in whole seconds; 0 when the probe fails.
    pub async fn probe_duration(&self, path: &Path) -> i64 {
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path);
        let output = match self.run_tool(&self.ffprobe, &mut command).await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(path = %path.display(), status = ?output.status.code(), "duration probe failed");
                return 0;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "duration probe failed");
                return 0;
            }
        };
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map(|value| value.round() as i64)
            .unwrap_or(0)
    }

    /// Best-effort poster frame: one frame at 10s, scaled for list views.
    pub async fn generate_thumbnail(&self, video: &Path, output: &Path) -> bool {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-i")
            .arg(video)
            .arg("-ss")
            .arg("00:00:10")
            .arg("-vframes")
            .arg("1")
            .arg("-vf")
            .arg("scale=640:360")
            .arg(output);
        match self.run_tool(&self.ffmpeg, &mut command).await {
            Ok(result) if result.status.success() => {
                info!(thumbnail = %output.display(), "thumbnail generated");
                true
            }
            Ok(result) => {
                warn!(
                    thumbnail = %output.display(),
                    status = ?result.status.code(),
                    "thumbnail generation failed"
                );
                false
            }
            Err(err) => {
                warn!(thumbnail = %output.display(), error = %err, "thumbnail generation failed");
                false
            }
        }
    }

    async fn run_tool(
        &self,
        tool: &Path,
        command: &mut Command,
    ) -> MediaResult<std::process::Output> {
        self.executor
            .run(command)
            .await
            .map_err(|source| MediaError::Spawn {
                tool: tool.display().to_string(),
                source,
            })
    }

    fn write_concat_list(&self, inputs: &[PathBuf]) -> MediaResult<NamedTempFile> {
        let mut list = NamedTempFile::new().map_err(|source| MediaError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        for input in inputs {
            // ffmpeg concat list syntax: file '<path>', single quotes escaped
            let escaped = input.to_string_lossy().replace('\'', "'\\''");
            writeln!(list, "file '{escaped}'").map_err(|source| MediaError::Io {
                path: list.path().to_path_buf(),
                source,
            })?;
        }
        list.flush().map_err(|source| MediaError::Io {
            path: list.path().to_path_buf(),
            source,
        })?;
        Ok(list)
    }
}
