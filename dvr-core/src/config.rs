use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DvrConfig {
    pub storage: StorageSection,
    pub recording: RecordingSection,
    #[serde(default)]
    pub merge: MergeSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

impl DvrConfig {
    pub fn segments_db_path(&self) -> PathBuf {
        Path::new(&self.storage.data_dir).join(&self.storage.segments_db)
    }

    pub fn daily_db_path(&self) -> PathBuf {
        Path::new(&self.storage.data_dir).join(&self.storage.daily_db)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub data_dir: String,
    #[serde(default = "default_segments_db")]
    pub segments_db: String,
    #[serde(default = "default_daily_db")]
    pub daily_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    pub output_dir: String,
    pub video_url_base: String,
    /// Title assigned to a freshly created daily aggregate; `{date}` is
    /// replaced with the recording date rendered as dd/mm/yyyy.
    #[serde(default = "default_title_template")]
    pub title_template: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

fn default_segments_db() -> String {
    "segments.sqlite".to_string()
}

fn default_daily_db() -> String {
    "daily.sqlite".to_string()
}

fn default_title_template() -> String {
    "Daily replay {date}".to_string()
}

fn default_retention_days() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    10
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

pub fn load_dvr_config<P: AsRef<Path>>(path: P) -> Result<DvrConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
