//! Loss-less join of standardized assets.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::fs_utils::remove_if_exists;

/// Output path for an account's merge started at `at`.
///
/// The batch tag keeps two batches started within the same second apart.
pub fn merged_output_path(
    merged_root: &Path,
    account: &str,
    at: DateTime<Utc>,
    batch: &str,
) -> PathBuf {
    let tag: String = batch.chars().take(8).collect();
    merged_root.join(account).join(format!(
        "{account}_merged_{}_{tag}.mp4",
        at.format("%Y%m%d_%H%M%S")
    ))
}

/// Concat demuxer manifest, one `file '<path>'` line per input.
pub fn create_concat_manifest(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

/// Stream-copy join over a manifest.
///
/// Timestamp repair flags are passed again in case any input still carries
/// negative timestamps.
pub fn build_concat_command(manifest: &Path, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(manifest, output)
        .op("concat")
        .input_args(["-f", "concat", "-safe", "0", "-fflags", "+genpts"])
        .output_args([
            "-map",
            "0",
            "-c",
            "copy",
            "-avoid_negative_ts",
            "make_zero",
            "-movflags",
            "+faststart",
        ])
}

/// Joins standardized assets into one output.
#[async_trait]
pub trait Concatenator: Send + Sync {
    /// Join `inputs` in order into `output`.
    ///
    /// Fails with [`MediaError::OutputExists`] rather than overwrite.
    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<PathBuf>;
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegConcatenator {
    runner: FfmpegRunner,
}

impl FfmpegConcatenator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.runner = self.runner.with_timeout(secs);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.runner = self.runner.with_cancel(token);
        self
    }
}

#[async_trait]
impl Concatenator for FfmpegConcatenator {
    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<PathBuf> {
        if inputs.is_empty() {
            return Err(MediaError::EmptyInput);
        }
        if output.exists() {
            return Err(MediaError::OutputExists(output.to_path_buf()));
        }
        if let Some(missing) = inputs.iter().find(|p| !p.exists()) {
            return Err(MediaError::FileNotFound(missing.clone()));
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "merged".to_string());
        let manifest = output.with_file_name(format!(".{stem}.concat.txt"));
        let partial = output.with_file_name(format!(".{stem}.partial.mp4"));

        tokio::fs::write(&manifest, create_concat_manifest(inputs)).await?;
        let result = self
            .runner
            .run(&build_concat_command(&manifest, &partial))
            .await;
        let _ = remove_if_exists(&manifest).await;

        if let Err(e) = result {
            let _ = remove_if_exists(&partial).await;
            return Err(e);
        }
        if output.exists() {
            let _ = remove_if_exists(&partial).await;
            return Err(MediaError::OutputExists(output.to_path_buf()));
        }

        tokio::fs::rename(&partial, output).await?;
        info!(inputs = inputs.len(), "Concatenated into {}", output.display());
        Ok(output.to_path_buf())
    }
}
