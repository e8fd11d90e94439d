//! Standardization encoding options.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::geometry::TargetResolution;

/// Default video codec (H.264)
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
/// Default H.264 profile
pub const DEFAULT_VIDEO_PROFILE: &str = "high";
/// Default pixel format
pub const DEFAULT_PIXEL_FORMAT: &str = "yuv420p";
/// Default audio codec
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default encoding preset
pub const DEFAULT_PRESET: &str = "fast";
/// Default CRF (Constant Rate Factor)
pub const DEFAULT_CRF: u8 = 20;
/// Default audio bitrate
pub const DEFAULT_AUDIO_BITRATE: &str = "128k";
/// Default audio sample rate
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44_100;
/// Default audio channel count
pub const DEFAULT_AUDIO_CHANNELS: u8 = 2;
/// Default output frame rate
pub const DEFAULT_FRAME_RATE: u32 = 30;
/// Default pad color
pub const DEFAULT_PAD_COLOR: &str = "black";

/// Every option recognized by the standardization step.
///
/// All assets of a batch are encoded with the same options, which is what
/// makes the later stream-copy join safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StandardizeOptions {
    pub target_width: u32,
    pub target_height: u32,

    #[serde(default = "default_pad_color")]
    pub pad_color: String,

    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    #[serde(default = "default_video_profile")]
    pub video_profile: String,

    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,

    #[serde(default = "default_preset")]
    pub preset: String,

    #[serde(default = "default_crf")]
    pub crf: u8,

    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,

    #[serde(default = "default_audio_channels")]
    pub audio_channels: u8,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Clamp negative timestamps and regenerate PTS
    #[serde(default = "default_true")]
    pub fix_negative_timestamps: bool,
}

fn default_pad_color() -> String {
    DEFAULT_PAD_COLOR.to_string()
}
fn default_video_codec() -> String {
    DEFAULT_VIDEO_CODEC.to_string()
}
fn default_video_profile() -> String {
    DEFAULT_VIDEO_PROFILE.to_string()
}
fn default_pixel_format() -> String {
    DEFAULT_PIXEL_FORMAT.to_string()
}
fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}
fn default_crf() -> u8 {
    DEFAULT_CRF
}
fn default_audio_codec() -> String {
    DEFAULT_AUDIO_CODEC.to_string()
}
fn default_audio_bitrate() -> String {
    DEFAULT_AUDIO_BITRATE.to_string()
}
fn default_audio_sample_rate() -> u32 {
    DEFAULT_AUDIO_SAMPLE_RATE
}
fn default_audio_channels() -> u8 {
    DEFAULT_AUDIO_CHANNELS
}
fn default_frame_rate() -> u32 {
    DEFAULT_FRAME_RATE
}
fn default_true() -> bool {
    true
}

impl Default for StandardizeOptions {
    fn default() -> Self {
        Self::for_target(TargetResolution::default_portrait())
    }
}

impl StandardizeOptions {
    /// Options for a target geometry with every other field at its default.
    pub fn for_target(target: TargetResolution) -> Self {
        Self {
            target_width: target.width,
            target_height: target.height,
            pad_color: default_pad_color(),
            video_codec: default_video_codec(),
            video_profile: default_video_profile(),
            pixel_format: default_pixel_format(),
            preset: default_preset(),
            crf: DEFAULT_CRF,
            audio_codec: default_audio_codec(),
            audio_bitrate: default_audio_bitrate(),
            audio_sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            audio_channels: DEFAULT_AUDIO_CHANNELS,
            frame_rate: DEFAULT_FRAME_RATE,
            fix_negative_timestamps: true,
        }
    }

    /// Apply environment overrides (`STANDARDIZE_*`) on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(fps) = std::env::var("STANDARDIZE_FPS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.frame_rate = fps;
        }
        if let Ok(color) = std::env::var("STANDARDIZE_PAD_COLOR") {
            self.pad_color = color;
        }
        if let Some(crf) = std::env::var("STANDARDIZE_CRF")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.crf = crf;
        }
        if let Ok(preset) = std::env::var("STANDARDIZE_PRESET") {
            self.preset = preset;
        }
        self
    }

    /// Returns the same options retargeted to another geometry.
    pub fn with_target(mut self, target: TargetResolution) -> Self {
        self.target_width = target.width;
        self.target_height = target.height;
        self
    }

    pub fn target(&self) -> TargetResolution {
        TargetResolution::new(self.target_width, self.target_height)
    }

    /// Convert the codec, frame rate and audio settings to FFmpeg output arguments.
    pub fn to_ffmpeg_args(&self) -> Vec<String> {
        let mut args = vec![
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-profile:v".to_string(),
            self.video_profile.clone(),
            "-pix_fmt".to_string(),
            self.pixel_format.clone(),
            "-preset".to_string(),
            self.preset.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-r".to_string(),
            self.frame_rate.to_string(),
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-b:a".to_string(),
            self.audio_bitrate.clone(),
            "-ar".to_string(),
            self.audio_sample_rate.to_string(),
            "-ac".to_string(),
            self.audio_channels.to_string(),
        ];

        if self.fix_negative_timestamps {
            args.extend_from_slice(&["-avoid_negative_ts".to_string(), "make_zero".to_string()]);
        }

        args
    }
}
