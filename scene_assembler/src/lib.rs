//! Stage 6: every final scene clip, in scene order, concatenated into one
//! video with a fade in and a fade out.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sr_app::cli::ProjectArgs;
use sr_app::logging::LogFormat;
use sr_app::manifest::list_unique_scene_files;
use sr_app::stage::{commit, staging_file};
use sr_app::{ProjectManifest, Stage, StageConfig, StageError, StageOptions, StageReport};
use sr_ffmpeg::EncodeProfile;
use sr_ffmpeg::concat::{ConcatInput, ConcatLayout, build_concat_command};
use sr_ffmpeg::probe::probe;
use types::SceneId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub profile: EncodeProfile,
    pub frame_rate: f64,
    pub fade_secs: f64,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        let layout = ConcatLayout::default();
        Self {
            profile: EncodeProfile::default(),
            frame_rate: layout.frame_rate,
            fade_secs: layout.fade_secs,
            log_format: LogFormat::default(),
        }
    }
}

impl StageConfig for Config {
    const SECTION: &'static str = "assemble";

    fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

/// Final clips of the project, one per scene, ordered by scene id.
///
/// # Errors
/// `MissingClips` when the directory holds none.
pub async fn discover_clips(final_dir: &Path) -> Result<Vec<(SceneId, PathBuf)>, StageError> {
    let clips = list_unique_scene_files(final_dir, ".mp4").await?;
    if clips.is_empty() {
        return Err(StageError::MissingClips {
            dir: final_dir.to_path_buf(),
        });
    }
    Ok(clips)
}

/// Probe every clip before starting the long encode.
///
/// The output takes the resolution of the first clip.
///
/// # Errors
/// `ClipsWithoutAudio` listing every clip missing an audio track, or the
/// first probe failure.
pub async fn preflight(
    clips: &[(SceneId, PathBuf)],
    config: &Config,
) -> Result<(Vec<ConcatInput>, ConcatLayout), StageError> {
    let mut inputs = Vec::with_capacity(clips.len());
    let mut silent = Vec::new();
    let mut resolution = None;

    for (scene_id, path) in clips {
        let probed = probe(path).await?;
        let duration = probed.duration().ok_or_else(|| sr_ffmpeg::FfmpegError::NoDuration {
            path: path.clone(),
        })?;

        if !probed.has_audio() {
            tracing::error!(scene = scene_id, "{} has no audio track", path.display());
            silent.push(path.clone());
        }
        if resolution.is_none() {
            resolution = Some(probed.resolution().ok_or_else(|| {
                sr_ffmpeg::FfmpegError::NoVideoStream { path: path.clone() }
            })?);
        }

        inputs.push(ConcatInput {
            path: path.clone(),
            duration,
        });
    }

    if !silent.is_empty() {
        return Err(StageError::ClipsWithoutAudio { clips: silent });
    }

    let defaults = ConcatLayout::default();
    let layout = ConcatLayout {
        resolution: resolution.unwrap_or(defaults.resolution),
        frame_rate: config.frame_rate,
        sample_rate: config.profile.audio_sample_rate,
        fade_secs: config.fade_secs,
    };
    Ok((inputs, layout))
}

/// # Errors
/// `MissingClips`, any pre-flight error, or an ffmpeg failure.
pub async fn assemble(
    manifest: &ProjectManifest,
    config: &Config,
    options: StageOptions,
) -> Result<StageReport, StageError> {
    let paths = manifest.paths();
    let clips = discover_clips(&paths.final_dir()).await?;
    let output = paths.complete_file();
    let mut report = StageReport::new(Stage::Assemble, clips.len());

    if options.skip_existing
        && tokio::fs::try_exists(&output)
            .await
            .map_err(StageError::io(&output))?
    {
        tracing::info!("{} already exists", output.display());
        report.skipped = clips.len();
        return Ok(report);
    }

    tracing::info!(
        clips = clips.len(),
        order = ?clips.iter().map(|(scene_id, _)| *scene_id).collect::<Vec<_>>(),
        "assembling {}",
        output.display()
    );

    let (inputs, layout) = preflight(&clips, config).await?;
    let expected: f64 = inputs.iter().map(|input| input.duration).sum();

    let staged = staging_file(&output).map_err(StageError::io(&output))?;
    sr_ffmpeg::run(build_concat_command(
        &inputs,
        staged.path(),
        &layout,
        &config.profile,
    )?)
    .await?;

    match probe(staged.path()).await.map(|probed| probed.duration()) {
        Ok(Some(actual)) => tracing::info!(
            duration_secs = actual,
            expected_secs = expected,
            "assembled {}",
            output.display()
        ),
        Ok(None) => tracing::warn!("assembled video reports no duration"),
        Err(err) => tracing::warn!("could not probe assembled video: {err}"),
    }

    commit(staged, &output).map_err(StageError::io(&output))?;
    report.generated = clips.len();
    Ok(report)
}

/// # Errors
/// `Ffmpeg` when ffmpeg or ffprobe is not installed, and any error from
/// `assemble`.
pub async fn run(args: &ProjectArgs, config: &Config) -> Result<StageReport, StageError> {
    sr_ffmpeg::check_tools()?;

    let manifest = ProjectManifest::resolve(args).await?;
    assemble(&manifest, config, args.stage_options()).await
}
