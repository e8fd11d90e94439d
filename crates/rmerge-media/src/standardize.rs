//! Per-asset standardization.
//!
//! Every asset of a batch is re-encoded to the same geometry, codecs,
//! frame rate, audio format and timestamp origin so the outputs can later
//! be joined with a stream copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rmerge_models::{StandardizeOptions, TargetResolution};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::filters::{silent_audio_source, standardize_audio_filter, standardize_video_filter};
use crate::fs_utils::{move_file, remove_if_exists};
use crate::probe::{MediaProbe, VideoInfo};

/// Deterministic output location for one asset of one batch.
///
/// Redelivered jobs resolve to the same file, which is what makes
/// reprocessing idempotent.
pub fn standardized_output_path(work_dir: &Path, batch_id: &str, identifier: &str) -> PathBuf {
    work_dir.join(batch_id).join(format!("{identifier}.mp4"))
}

/// Build the FFmpeg invocation for one asset.
///
/// Sources without audio get a generated silent track so every output
/// carries the same stream layout.
pub fn build_standardize_command(
    input: &Path,
    output: &Path,
    options: &StandardizeOptions,
    has_audio: bool,
) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(input, output).op("standardize");

    if options.fix_negative_timestamps {
        cmd = cmd.input_args(["-fflags", "+genpts"]);
    }

    cmd = if has_audio {
        cmd.map("0:v:0").map("0:a:0")
    } else {
        cmd.extra_input(["-f", "lavfi"], silent_audio_source(options))
            .map("0:v:0")
            .map("1:a:0")
            .output_arg("-shortest")
    };

    cmd.video_filter(standardize_video_filter(options))
        .audio_filter(standardize_audio_filter(options))
        .output_args(options.to_ffmpeg_args())
        .output_args([
            "-sn",
            "-dn",
            "-map_metadata",
            "-1",
            "-video_track_timescale",
            "90000",
            "-movflags",
            "+faststart",
        ])
}

/// Check a probed output against the batch target.
pub fn verify_geometry(info: &VideoInfo, target: TargetResolution) -> MediaResult<()> {
    let actual = info.resolution();
    if actual == target {
        Ok(())
    } else {
        Err(MediaError::GeometryMismatch {
            expected: target,
            actual,
        })
    }
}

/// Normalizes one asset to the batch contract.
#[async_trait]
pub trait Standardizer: Send + Sync {
    /// Write the standardized form of `input` to `output`.
    ///
    /// An existing non-empty `output` counts as success.
    async fn standardize(
        &self,
        input: &Path,
        output: &Path,
        options: &StandardizeOptions,
    ) -> MediaResult<PathBuf>;
}

/// [`Standardizer`] that shells out to FFmpeg.
pub struct FfmpegStandardizer {
    probe: Arc<dyn MediaProbe>,
    runner: FfmpegRunner,
    verify: bool,
}

impl FfmpegStandardizer {
    pub fn new(probe: Arc<dyn MediaProbe>) -> Self {
        Self {
            probe,
            runner: FfmpegRunner::new(),
            verify: false,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.runner = self.runner.with_timeout(secs);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.runner = self.runner.with_cancel(token);
        self
    }

    /// Re-probe each output and reject geometry that misses the target.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    async fn encode(
        &self,
        input: &Path,
        partial: &Path,
        options: &StandardizeOptions,
    ) -> MediaResult<()> {
        let has_audio = match self.probe.probe(input).await {
            Ok(info) => info.has_audio,
            Err(e) => {
                warn!("Could not probe {} before encoding: {}", input.display(), e);
                true
            }
        };

        let cmd = build_standardize_command(input, partial, options, has_audio);
        self.runner.run(&cmd).await?;

        if self.verify {
            let info = self.probe.probe(partial).await?;
            verify_geometry(&info, options.target())?;
        }
        Ok(())
    }
}

#[async_trait]
impl Standardizer for FfmpegStandardizer {
    async fn standardize(
        &self,
        input: &Path,
        output: &Path,
        options: &StandardizeOptions,
    ) -> MediaResult<PathBuf> {
        if is_complete(output).await {
            info!("Already standardized: {}", output.display());
            return Ok(output.to_path_buf());
        }
        if !input.exists() {
            return Err(MediaError::FileNotFound(input.to_path_buf()));
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(output);
        debug!(
            target = %options.target(),
            "Standardizing {} -> {}",
            input.display(),
            output.display()
        );

        if let Err(e) = self.encode(input, &partial, options).await {
            let _ = remove_if_exists(&partial).await;
            return Err(e);
        }

        move_file(&partial, output).await?;
        Ok(output.to_path_buf())
    }
}

async fn is_complete(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Hidden sibling that keeps the `.mp4` extension for format detection.
fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!(".{stem}.{}.partial.mp4", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct NoProbe;

    #[async_trait]
    impl MediaProbe for NoProbe {
        async fn probe(&self, path: &Path) -> MediaResult<VideoInfo> {
            Err(MediaError::FileNotFound(path.to_path_buf()))
        }
    }

    fn info(width: u32, height: u32) -> VideoInfo {
        VideoInfo {
            duration: 1.0,
            width,
            height,
            rotation: 0,
            fps: 30.0,
            codec: "h264".into(),
            has_audio: true,
        }
    }

    #[test]
    fn test_command_normalizes_everything() {
        let options = StandardizeOptions::for_target(TargetResolution::new(720, 1280));
        let args = build_standardize_command(
            Path::new("/in/a.mov"),
            Path::new("/out/a.mp4"),
            &options,
            true,
        )
        .build_args();
        let joined = args.join(" ");

        assert!(joined.contains("-fflags +genpts -i /in/a.mov"));
        assert!(joined.contains("scale=720:1280:force_original_aspect_ratio=decrease"));
        assert!(joined.contains("-map 0:a:0"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-avoid_negative_ts make_zero"));
        assert!(!joined.contains("anullsrc"));
        assert_eq!(args.last().unwrap(), "/out/a.mp4");
    }

    #[test]
    fn test_command_adds_silence_without_audio() {
        let options = StandardizeOptions::default();
        let joined = build_standardize_command(
            Path::new("/in/a.mp4"),
            Path::new("/out/a.mp4"),
            &options,
            false,
        )
        .build_args()
        .join(" ");

        assert!(joined.contains("-f lavfi -i anullsrc=channel_layout=stereo:sample_rate=44100"));
        assert!(joined.contains("-map 1:a:0"));
        assert!(joined.contains("-shortest"));
    }

    #[test]
    fn test_verify_geometry() {
        let target = TargetResolution::new(1080, 1920);
        assert!(verify_geometry(&info(1080, 1920), target).is_ok());
        assert!(matches!(
            verify_geometry(&info(1920, 1080), target),
            Err(MediaError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn test_output_path_is_deterministic() {
        let a = standardized_output_path(Path::new("/work"), "batch1", "abc");
        assert_eq!(a, PathBuf::from("/work/batch1/abc.mp4"));
        assert_eq!(a, standardized_output_path(Path::new("/work"), "batch1", "abc"));
        assert_ne!(partial_path(&a), partial_path(&a));
    }

    #[tokio::test]
    async fn test_existing_output_is_success() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("done.mp4");
        tokio::fs::write(&output, b"already").await.unwrap();

        let standardizer = FfmpegStandardizer::new(Arc::new(NoProbe));
        let result = standardizer
            .standardize(
                Path::new("/does/not/exist.mp4"),
                &output,
                &StandardizeOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, output);
    }

    #[tokio::test]
    async fn test_missing_input() {
        let dir = TempDir::new().unwrap();
        let standardizer = FfmpegStandardizer::new(Arc::new(NoProbe));
        let err = standardizer
            .standardize(
                &dir.path().join("missing.mp4"),
                &dir.path().join("out.mp4"),
                &StandardizeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }
}
