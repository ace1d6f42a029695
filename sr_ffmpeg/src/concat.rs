use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::{EncodeProfile, FfmpegError, seconds};

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatInput {
    pub path: PathBuf,
    pub duration: f64,
}

/// Common format every input is normalized to before concatenation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatLayout {
    pub resolution: (u32, u32),
    pub frame_rate: f64,
    pub sample_rate: u32,
    pub fade_secs: f64,
}

impl Default for ConcatLayout {
    fn default() -> Self {
        Self {
            resolution: (1024, 576),
            frame_rate: 24.0,
            sample_rate: 48000,
            fade_secs: 1.0,
        }
    }
}

fn create_complex_filter(filter_steps: &[String]) -> String {
    filter_steps.join(";")
}

fn normalize_video(index: usize, layout: &ConcatLayout) -> String {
    let (width, height) = layout.resolution;
    format!(
        "[{index}:v]scale=w={width}:h={height}:force_original_aspect_ratio=decrease,pad=w={width}:h={height}:x=(ow-iw)/2:y=(oh-ih)/2,setsar=1,fps=fps={fps},format={pix_fmt},setpts=PTS-STARTPTS[v{index}]",
        fps = layout.frame_rate,
        pix_fmt = crate::encode::PIXEL_FORMAT,
    )
}

fn normalize_audio(index: usize, layout: &ConcatLayout) -> String {
    format!(
        "[{index}:a]aresample={sample_rate},aformat=channel_layouts=stereo,asetpts=PTS-STARTPTS[a{index}]",
        sample_rate = layout.sample_rate,
    )
}

fn concat_segments(count: usize) -> String {
    let pads: String = (0..count).map(|i| format!("[v{i}][a{i}]")).collect();
    format!("{pads}concat=n={count}:v=1:a=1[vcat][acat]")
}

// One fade at each end of the whole timeline, never per clip.
fn timeline_fades(total: f64, fade_secs: f64) -> Vec<String> {
    let fade = fade_secs.min(total / 2.0).max(0.0);
    let fade_out_start = (total - fade).max(0.0);
    let d = seconds(fade);
    let st = seconds(fade_out_start);

    vec![
        format!("[vcat]fade=t=in:st=0:d={d},fade=t=out:st={st}:d={d}[vout]"),
        format!("[acat]afade=t=in:st=0:d={d},afade=t=out:st={st}:d={d}[aout]"),
    ]
}

/// The full filter graph for `inputs`, in the order given.
pub fn build_filter_graph(inputs: &[ConcatInput], layout: &ConcatLayout) -> String {
    let mut steps = Vec::new();
    for index in 0..inputs.len() {
        steps.push(normalize_video(index, layout));
        steps.push(normalize_audio(index, layout));
    }
    steps.push(concat_segments(inputs.len()));

    let total: f64 = inputs.iter().map(|input| input.duration).sum();
    steps.extend(timeline_fades(total, layout.fade_secs));

    create_complex_filter(&steps)
}

/// Build the ffmpeg command that stitches `inputs` into `output`.
///
/// The clips are re-encoded through a filter graph rather than joined at the
/// container level, since clips from different runs may not share encoding
/// parameters.
///
/// # Errors
/// `InvalidInput` when `inputs` is empty.
pub fn build_concat_command(
    inputs: &[ConcatInput],
    output: &Path,
    layout: &ConcatLayout,
    profile: &EncodeProfile,
) -> Result<Command, FfmpegError> {
    if inputs.is_empty() {
        return Err(FfmpegError::InvalidInput(
            "nothing to concatenate".to_string(),
        ));
    }

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-y");

    for input in inputs {
        cmd.arg("-i").arg(&input.path);
    }

    cmd.arg("-filter_complex")
        .arg(build_filter_graph(inputs, layout));
    cmd.arg("-map").arg("[vout]").arg("-map").arg("[aout]");
    profile.apply(&mut cmd);
    cmd.arg(output);

    Ok(cmd)
}
