//! FFmpeg filter chains for standardization.

use rmerge_models::StandardizeOptions;

/// Video chain: fit inside the target, pad centered, square pixels, fixed
/// frame rate and pixel format, then restart PTS at zero.
///
/// Aspect ratio is always preserved and nothing is cropped.
pub fn standardize_video_filter(options: &StandardizeOptions) -> String {
    let (w, h) = (options.target_width, options.target_height);
    let mut chain = vec![
        format!("scale={w}:{h}:force_original_aspect_ratio=decrease"),
        format!("pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color={}", options.pad_color),
        "setsar=1".to_string(),
        format!("fps={}", options.frame_rate),
        format!("format={}", options.pixel_format),
    ];
    if options.fix_negative_timestamps {
        chain.push("setpts=PTS-STARTPTS".to_string());
    }
    chain.join(",")
}

/// Audio chain: resample to the fixed rate (stretching to cover gaps) and
/// restart PTS at zero.
pub fn standardize_audio_filter(options: &StandardizeOptions) -> String {
    let mut chain = vec![format!(
        "aresample={}:async=1:first_pts=0",
        options.audio_sample_rate
    )];
    if options.fix_negative_timestamps {
        chain.push("asetpts=PTS-STARTPTS".to_string());
    }
    chain.join(",")
}

/// `lavfi` source producing silence in the standardized audio format.
pub fn silent_audio_source(options: &StandardizeOptions) -> String {
    format!(
        "anullsrc=channel_layout={}:sample_rate={}",
        channel_layout(options.audio_channels),
        options.audio_sample_rate
    )
}

fn channel_layout(channels: u8) -> &'static str {
    match channels {
        1 => "mono",
        6 => "5.1",
        _ => "stereo",
    }
}
