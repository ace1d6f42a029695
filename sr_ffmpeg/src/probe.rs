use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

use crate::FfmpegError;

/*
Trimmed sample of the ffprobe output this reads
{
    "streams": [
        {
            "index": 0,
            "codec_name": "h264",
            "codec_type": "video",
            "width": 1024,
            "height": 576,
            "pix_fmt": "yuv420p",
            "r_frame_rate": "6/1",
            "avg_frame_rate": "6/1",
            "duration": "4.166667"
        },
        {
            "index": 1,
            "codec_name": "aac",
            "codec_type": "audio",
            "sample_rate": "48000",
            "channels": 2,
            "duration": "8.213333"
        }
    ],
    "format": {
        "filename": "scene_01_final.mp4",
        "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
        "duration": "8.213333"
    }
}
*/

fn str_to_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Ok(s.parse::<u32>().ok())
}

fn str_to_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Ok(s.parse::<f64>().ok().filter(|d| d.is_finite()))
}

#[derive(Debug, Deserialize)]
pub struct ProbeStream {
    pub index: u32,
    pub codec_type: String,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pix_fmt: Option<String>,
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub channels: Option<u32>,

    #[serde(default)]
    #[serde(deserialize_with = "str_to_u32")]
    pub sample_rate: Option<u32>,

    #[serde(default)]
    #[serde(deserialize_with = "str_to_f64")]
    pub duration: Option<f64>,
}

impl ProbeStream {
    pub fn is_video(&self) -> bool {
        self.codec_type == "video"
    }

    pub fn is_audio(&self) -> bool {
        self.codec_type == "audio"
    }

    /// Frames per second, preferring the average rate.
    pub fn frame_rate(&self) -> Option<f64> {
        self.avg_frame_rate
            .as_deref()
            .and_then(parse_rate)
            .or_else(|| self.r_frame_rate.as_deref().and_then(parse_rate))
    }
}

#[derive(Debug, Deserialize)]
pub struct ProbeFormat {
    pub filename: String,
    pub format_name: Option<String>,

    #[serde(default)]
    #[serde(deserialize_with = "str_to_f64")]
    pub duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    pub format: ProbeFormat,
}

impl ProbeOutput {
    /// Container duration, falling back to the longest stream.
    pub fn duration(&self) -> Option<f64> {
        self.format
            .duration
            .or_else(|| {
                self.streams
                    .iter()
                    .filter_map(|stream| stream.duration)
                    .reduce(f64::max)
            })
            .filter(|d| *d > 0.0)
    }

    pub fn video_stream(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|stream| stream.is_video())
    }

    pub fn has_audio(&self) -> bool {
        self.streams.iter().any(ProbeStream::is_audio)
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        let stream = self.video_stream()?;
        Some((stream.width?, stream.height?))
    }
}

// "30000/1001" -> 29.97; "0/0" -> None
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

/// Run ffprobe on a media file.
///
/// # Errors
/// `Spawn` if ffprobe cannot start, `Failed` if it rejects the file,
/// `ProbeParse` if its JSON cannot be read.
pub async fn probe(path: &Path) -> Result<ProbeOutput, FfmpegError> {
    tracing::debug!("probing {}", path.display());

    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path)
        .output()
        .await
        .map_err(|source| FfmpegError::Spawn {
            program: "ffprobe",
            source,
        })?;

    if !output.status.success() {
        return Err(FfmpegError::Failed {
            program: "ffprobe",
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(|source| {
        FfmpegError::ProbeParse {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Duration of a media file in seconds.
///
/// # Errors
/// Any probe error, or `NoDuration` when neither the container nor a stream
/// reports one.
pub async fn media_duration(path: &Path) -> Result<f64, FfmpegError> {
    probe(path).await?.duration().ok_or_else(|| FfmpegError::NoDuration {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1024,
                "height": 576,
                "pix_fmt": "yuv420p",
                "r_frame_rate": "6/1",
                "avg_frame_rate": "6/1",
                "duration": "4.166667"
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "sample_rate": "48000",
                "channels": 2,
                "duration": "8.213333"
            }
        ],
        "format": {
            "filename": "scene_01_final.mp4",
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "8.213333"
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let output: ProbeOutput = serde_json::from_str(SAMPLE).unwrap();

        assert_eq!(output.duration(), Some(8.213_333));
        assert!(output.has_audio());
        assert_eq!(output.resolution(), Some((1024, 576)));
        assert_eq!(output.video_stream().unwrap().frame_rate(), Some(6.0));
        assert_eq!(output.streams[1].sample_rate, Some(48000));
    }

    #[test]
    fn test_duration_falls_back_to_streams() {
        let output: ProbeOutput = serde_json::from_str(
            r#"{
                "streams": [
                    {"index": 0, "codec_type": "video", "duration": "3.5"},
                    {"index": 1, "codec_type": "audio", "duration": "N/A"}
                ],
                "format": {"filename": "x.mp4", "duration": "N/A"}
            }"#,
        )
        .unwrap();

        assert_eq!(output.duration(), Some(3.5));
        assert!(output.has_audio());
    }

    #[test]
    fn test_silent_clip() {
        let output: ProbeOutput = serde_json::from_str(
            r#"{
                "streams": [{"index": 0, "codec_type": "video"}],
                "format": {"filename": "scene_02.mp4"}
            }"#,
        )
        .unwrap();

        assert_eq!(output.duration(), None);
        assert!(!output.has_audio());
        assert_eq!(output.resolution(), None);
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("25/1"), Some(25.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }
}
