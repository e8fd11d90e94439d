//! FFmpeg CLI wrapper for the merge pipeline.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building and a runner with timeout and cancellation
//! - FFprobe-backed probing behind the [`MediaProbe`] trait
//! - Target resolution voting across a batch
//! - Per-asset standardization (geometry, codecs, frame rate, timestamps, audio)
//! - Stream-copy concatenation of standardized assets

pub mod command;
pub mod concat;
pub mod config;
pub mod error;
pub mod filters;
pub mod fs_utils;
pub mod probe;
pub mod progress;
pub mod resolution;
pub mod standardize;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use concat::{create_concat_manifest, merged_output_path, Concatenator, FfmpegConcatenator};
pub use config::MediaConfig;
pub use error::{MediaError, MediaResult};
pub use probe::{FfprobeProbe, MediaProbe, VideoInfo};
pub use progress::FfmpegProgress;
pub use resolution::{analyze, select_target, ResolutionReport};
pub use standardize::{
    build_standardize_command, standardized_output_path, FfmpegStandardizer, Standardizer,
};
