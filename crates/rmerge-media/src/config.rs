//! Media configuration.

use std::path::PathBuf;

use rmerge_models::StandardizeOptions;

/// Media configuration.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Root directory for merged outputs
    pub merged_root: PathBuf,
    /// Timeout for a single FFmpeg invocation
    pub ffmpeg_timeout_secs: u64,
    /// Encoding options applied to every asset (target is set per batch)
    pub options: StandardizeOptions,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            merged_root: PathBuf::from("./data/merged"),
            ffmpeg_timeout_secs: 1800,
            options: StandardizeOptions::default(),
        }
    }
}

impl MediaConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            merged_root: std::env::var("MERGED_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/merged")),
            ffmpeg_timeout_secs: std::env::var("FFMPEG_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1800),
            options: StandardizeOptions::default().with_env_overrides(),
        }
    }
}
