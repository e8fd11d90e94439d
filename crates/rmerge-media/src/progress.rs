//! FFmpeg `-progress pipe:2` parsing.

use serde::{Deserialize, Serialize};

/// Progress snapshot emitted at each `progress=` line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Current frame number
    pub frame: u64,
    /// Encoding speed relative to realtime
    pub speed: f64,
    /// Set on the final `progress=end` line
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Percentage of `total_ms` written so far, capped at 100.
    pub fn percentage(&self, total_ms: i64) -> f64 {
        if total_ms <= 0 {
            return 0.0;
        }
        ((self.out_time_ms as f64 / total_ms as f64) * 100.0).min(100.0)
    }

    /// Fold one `key=value` line into `self`.
    ///
    /// Returns a snapshot when the line closes a progress block.
    pub fn apply_line(&mut self, line: &str) -> Option<FfmpegProgress> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // FFmpeg reports microseconds under both names.
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_ms = us / 1000;
                }
            }
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.frame = frame;
                }
            }
            "speed" => {
                if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                    self.speed = speed;
                }
            }
            "progress" => {
                self.is_complete = value == "end";
                return Some(self.clone());
            }
            _ => {}
        }
        None
    }

    /// True for lines that belong to the progress stream rather than log output.
    pub fn is_progress_line(line: &str) -> bool {
        matches!(
            line.split_once('=').map(|(k, _)| k),
            Some(
                "frame"
                    | "fps"
                    | "stream_0_0_q"
                    | "bitrate"
                    | "total_size"
                    | "out_time_us"
                    | "out_time_ms"
                    | "out_time"
                    | "dup_frames"
                    | "drop_frames"
                    | "speed"
                    | "progress"
            )
        )
    }
}
