//! Duration-matching merge of a silent clip with its narration.
//!
//! Narration decides the scene length. The clip is treated as a loopable
//! texture: it is repeated `ceil(A / V)` times so the repeated video covers
//! the narration, then hard-cut to exactly `A` seconds and muxed with the
//! full audio track.

use std::path::Path;

use tokio::process::Command;

use crate::{EncodeProfile, FfmpegError, seconds};

// absorbs probe rounding so 8.2 / 4.1 stays 2 loops
const LOOP_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergePlan {
    pub audio_duration: f64,
    pub video_duration: f64,
    pub loops: u32,
}

impl MergePlan {
    /// # Errors
    /// `InvalidInput` if either duration is not a positive finite number.
    pub fn new(audio_duration: f64, video_duration: f64) -> Result<Self, FfmpegError> {
        if !(audio_duration.is_finite() && audio_duration > 0.0) {
            return Err(FfmpegError::InvalidInput(format!(
                "audio duration must be positive, got {audio_duration}"
            )));
        }
        if !(video_duration.is_finite() && video_duration > 0.0) {
            return Err(FfmpegError::InvalidInput(format!(
                "video duration must be positive, got {video_duration}"
            )));
        }

        let ratio = (audio_duration / video_duration - LOOP_EPSILON).ceil().max(1.0);
        // ratio is a small positive whole number here
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let loops = ratio.min(f64::from(u32::MAX)) as u32;

        Ok(Self {
            audio_duration,
            video_duration,
            loops,
        })
    }

    /// Length of the repeated video before trimming.
    pub fn looped_duration(&self) -> f64 {
        f64::from(self.loops) * self.video_duration
    }
}

/// Build the ffmpeg command for one scene.
///
/// `-stream_loop` counts extra plays, so `loops - 1` is passed.
pub fn build_merge_command(
    video: &Path,
    audio: &Path,
    output: &Path,
    plan: &MergePlan,
    profile: &EncodeProfile,
) -> Command {
    let mut cmd = Command::new("ffmpeg");

    cmd.arg("-hide_banner").arg("-y");
    cmd.arg("-stream_loop")
        .arg((plan.loops - 1).to_string())
        .arg("-i")
        .arg(video);
    cmd.arg("-i").arg(audio);
    cmd.arg("-map").arg("0:v:0").arg("-map").arg("1:a:0");
    cmd.arg("-t").arg(seconds(plan.audio_duration));
    profile.apply(&mut cmd);
    cmd.arg(output);

    cmd
}

/// True when `actual` is within one frame of `expected` at `frame_rate`.
pub fn within_one_frame(expected: f64, actual: f64, frame_rate: f64) -> bool {
    let frame = if frame_rate > 0.0 { 1.0 / frame_rate } else { 0.1 };
    (expected - actual).abs() <= frame + f64::EPSILON
}
