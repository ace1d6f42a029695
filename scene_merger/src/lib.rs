//! Stage 5: one final clip per narrated scene, exactly as long as its
//! narration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sr_app::cli::ProjectArgs;
use sr_app::logging::LogFormat;
use sr_app::stage::{commit, staging_file};
use sr_app::{
    AssetKind, AssetPaths, ProjectManifest, SceneError, SceneJob, SceneWorker,
    SkipReason, Stage, StageConfig, StageError, StageOptions, StageReport,
    WorkResult, run_stage,
};
use sr_ffmpeg::EncodeProfile;
use sr_ffmpeg::merge::{MergePlan, build_merge_command, within_one_frame};
use sr_ffmpeg::probe::{media_duration, probe};
use types::{ProjectScenes, SceneId};

// used when neither the output nor the input reports a frame rate
const FALLBACK_FRAME_RATE: f64 = 24.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub profile: EncodeProfile,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: EncodeProfile::fast(),
            log_format: LogFormat::default(),
        }
    }
}

impl StageConfig for Config {
    const SECTION: &'static str = "merge";

    fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

/// Inputs of one merge, also the job's upstream assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInputs {
    pub clip: PathBuf,
    pub audio: PathBuf,
}

/// Narrated scenes need a clip and an audio file; the rest are skipped.
pub fn plan_jobs(paths: &AssetPaths, scenes: &ProjectScenes) -> Vec<SceneJob<MergeInputs>> {
    scenes
        .scenes()
        .iter()
        .map(|scene| {
            let inputs = MergeInputs {
                clip: paths.asset(AssetKind::Clip, scene.scene_id),
                audio: paths.asset(AssetKind::Audio, scene.scene_id),
            };
            let job = SceneJob::new(scene.scene_id, inputs.clone())
                .output(paths.asset(AssetKind::FinalClip, scene.scene_id));

            if scene.has_narration() {
                job.upstream(inputs.clip).upstream(inputs.audio)
            } else {
                job.skip_because(SkipReason::EmptyNarration)
            }
        })
        .collect()
}

pub struct MergeWorker {
    profile: EncodeProfile,
}

impl MergeWorker {
    pub const fn new(profile: EncodeProfile) -> Self {
        Self { profile }
    }

    // a merged file more than a frame off is kept, only reported
    async fn check_output(
        &self,
        scene_id: SceneId,
        output: &Path,
        expected: f64,
        input_rate: Option<f64>,
    ) {
        match probe(output).await {
            Ok(merged) => {
                let rate = merged
                    .video_stream()
                    .and_then(sr_ffmpeg::probe::ProbeStream::frame_rate)
                    .or(input_rate)
                    .unwrap_or(FALLBACK_FRAME_RATE);
                match merged.duration() {
                    Some(actual) if within_one_frame(expected, actual, rate) => {}
                    Some(actual) => tracing::warn!(
                        scene = scene_id,
                        "merged clip is {actual:.3}s, narration is {expected:.3}s"
                    ),
                    None => tracing::warn!(scene = scene_id, "merged clip reports no duration"),
                }
            }
            Err(err) => tracing::warn!(scene = scene_id, "could not probe merged clip: {err}"),
        }
    }
}

impl SceneWorker for MergeWorker {
    type Payload = MergeInputs;

    async fn generate(&mut self, job: &SceneJob<MergeInputs>) -> Result<WorkResult, SceneError> {
        let Some(target) = job.outputs.first() else {
            return Err(SceneError::Generation("job has no output path".to_string()));
        };
        let inputs = &job.payload;

        let clip = match probe(&inputs.clip).await {
            Ok(clip) => clip,
            Err(err) => {
                tracing::warn!(
                    scene = job.scene_id,
                    "cannot probe {}: {err}",
                    inputs.clip.display()
                );
                return Ok(WorkResult::Skipped(SkipReason::Unprobeable(err.to_string())));
            }
        };
        let Some(video_duration) = clip.duration() else {
            tracing::warn!(scene = job.scene_id, "{} reports no duration", inputs.clip.display());
            return Ok(WorkResult::Skipped(SkipReason::Unprobeable(
                "clip reports no duration".to_string(),
            )));
        };
        let input_rate = clip.video_stream().and_then(sr_ffmpeg::probe::ProbeStream::frame_rate);

        let audio_duration = media_duration(&inputs.audio).await?;
        let plan = MergePlan::new(audio_duration, video_duration)?;
        tracing::info!(
            scene = job.scene_id,
            audio_secs = audio_duration,
            video_secs = video_duration,
            loops = plan.loops,
            "merging"
        );

        let staged = staging_file(target)?;
        sr_ffmpeg::run(build_merge_command(
            &inputs.clip,
            &inputs.audio,
            staged.path(),
            &plan,
            &self.profile,
        ))
        .await?;

        self.check_output(job.scene_id, staged.path(), audio_duration, input_rate)
            .await;
        commit(staged, target)?;
        Ok(WorkResult::Generated)
    }
}

pub async fn merge_scenes(
    manifest: &ProjectManifest,
    scenes: &ProjectScenes,
    config: &Config,
    options: StageOptions,
) -> StageReport {
    let mut worker = MergeWorker::new(config.profile.clone());
    let jobs = plan_jobs(&manifest.paths(), scenes);
    run_stage(Stage::Merge, &mut worker, jobs, options).await
}

/// # Errors
/// `Ffmpeg` when ffmpeg or ffprobe is not installed, and any error resolving
/// the project.
pub async fn run(args: &ProjectArgs, config: &Config) -> Result<StageReport, StageError> {
    sr_ffmpeg::check_tools()?;

    let manifest = ProjectManifest::resolve(args).await?;
    let scenes = manifest.load_scenes().await?;

    Ok(merge_scenes(&manifest, &scenes, config, args.stage_options()).await)
}
