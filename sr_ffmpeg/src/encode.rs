use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// H.264 with 4:2:0 chroma and AAC audio. Some players refuse anything else,
/// so the codecs and pixel format are fixed; only speed and quality knobs
/// are configurable.
pub const VIDEO_CODEC: &str = "libx264";
pub const PIXEL_FORMAT: &str = "yuv420p";
pub const AUDIO_CODEC: &str = "aac";
pub const MIN_AUDIO_BITRATE_KBPS: u32 = 192;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeProfile {
    pub preset: String,
    pub crf: u8,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        Self {
            preset: "medium".to_string(),
            crf: 23,
            audio_bitrate_kbps: MIN_AUDIO_BITRATE_KBPS,
            audio_sample_rate: 48000,
        }
    }
}

impl EncodeProfile {
    /// Faster preset used for per-scene merges.
    pub fn fast() -> Self {
        Self {
            preset: "fast".to_string(),
            ..Self::default()
        }
    }

    /// Append codec, pixel format, bitrate and progressive-start flags.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.arg("-c:v")
            .arg(VIDEO_CODEC)
            .arg("-preset")
            .arg(&self.preset)
            .arg("-crf")
            .arg(self.crf.min(51).to_string());
        cmd.arg("-pix_fmt").arg(PIXEL_FORMAT);
        cmd.arg("-c:a")
            .arg(AUDIO_CODEC)
            .arg("-b:a")
            .arg(format!(
                "{}k",
                self.audio_bitrate_kbps.max(MIN_AUDIO_BITRATE_KBPS)
            ))
            .arg("-ar")
            .arg(self.audio_sample_rate.to_string());
        // moov atom before the media data
        cmd.arg("-movflags").arg("+faststart");
    }
}
