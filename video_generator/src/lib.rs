//! Stage 4: a short silent clip per scene, animated from its first image.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sr_app::cli::ProjectArgs;
use sr_app::config::ResourceConfig;
use sr_app::engine::{EngineCommand, EngineProcess};
use sr_app::logging::LogFormat;
use sr_app::manifest::list_scene_files;
use sr_app::stage::{commit, staging_file};
use sr_app::{
    AssetKind, AssetPaths, NoModel, ProjectManifest, SceneError, SceneJob,
    SceneWorker, Stage, StageConfig, StageError, StageOptions, StageReport,
    WorkResult, pending_work, run_stage,
};
use sr_gpu::{MIB, ResourceManager, SlotRequest};
use types::{ProjectScenes, SceneId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fps: u32,
    /// Amount of motion, 1 to 255.
    pub motion_bucket: u8,
    pub frames: u32,
    pub noise_aug_strength: f64,
    /// Base seed. Each clip uses `seed + scene_id`.
    pub seed: u64,
    pub engine: EngineCommand,
    pub load_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub model_memory_mb: u64,
    pub resources: ResourceConfig,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fps: 6,
            motion_bucket: 127,
            frames: 25,
            noise_aug_strength: 0.02,
            seed: 42,
            engine: EngineCommand::new("storyreel-video-engine", Vec::<String>::new()),
            load_timeout_secs: 600,
            request_timeout_secs: 900,
            model_memory_mb: 14 * 1024,
            resources: ResourceConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl StageConfig for Config {
    const SECTION: &'static str = "video";

    fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

/// One clip as sent to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoRequest {
    pub image: PathBuf,
    pub output: PathBuf,
    pub fps: u32,
    pub motion_bucket: u8,
    pub frames: u32,
    pub noise_aug_strength: f64,
    pub seed: u64,
}

/// Image-to-video capability.
pub trait VideoEngine {
    /// Animate `request.image` into `request.output`.
    fn animate(&mut self, request: &VideoRequest) -> impl Future<Output = Result<(), SceneError>>;
}

impl VideoEngine for EngineProcess {
    async fn animate(&mut self, request: &VideoRequest) -> Result<(), SceneError> {
        self.request(request).await?;
        Ok(())
    }
}

// "scene_03_var_02.png" -> 2
fn variation_from_file_name(name: &str) -> Option<u32> {
    let rest = &name[name.find("_var_")? + "_var_".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// The first image variation of every scene that has one.
///
/// # Errors
/// If the images directory cannot be read.
pub async fn source_images(images_dir: &Path) -> Result<BTreeMap<SceneId, PathBuf>, StageError> {
    let mut firsts: BTreeMap<SceneId, (u32, PathBuf)> = BTreeMap::new();

    for (scene_id, path) in list_scene_files(images_dir, ".png").await? {
        let variation = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(variation_from_file_name)
            .unwrap_or(u32::MAX);

        let replace = firsts
            .get(&scene_id)
            .is_none_or(|(seen, _)| variation < *seen);
        if replace {
            firsts.insert(scene_id, (variation, path));
        }
    }

    Ok(firsts
        .into_iter()
        .map(|(scene_id, (_, path))| (scene_id, path))
        .collect())
}

pub fn plan_jobs(
    paths: &AssetPaths,
    scenes: &ProjectScenes,
    images: &BTreeMap<SceneId, PathBuf>,
    config: &Config,
) -> Vec<SceneJob<u64>> {
    scenes
        .scenes()
        .iter()
        .map(|scene| {
            let image = images.get(&scene.scene_id).cloned().unwrap_or_else(|| {
                paths.asset(AssetKind::Image { variation: 1 }, scene.scene_id)
            });
            SceneJob::new(scene.scene_id, config.seed.wrapping_add(u64::from(scene.scene_id)))
                .output(paths.asset(AssetKind::Clip, scene.scene_id))
                .upstream(image)
        })
        .collect()
}

pub struct VideoWorker<'a, E> {
    engine: &'a mut E,
    config: &'a Config,
}

impl<'a, E: VideoEngine> VideoWorker<'a, E> {
    pub const fn new(engine: &'a mut E, config: &'a Config) -> Self {
        Self { engine, config }
    }
}

impl<E: VideoEngine> SceneWorker for VideoWorker<'_, E> {
    type Payload = u64;

    async fn generate(&mut self, job: &SceneJob<u64>) -> Result<WorkResult, SceneError> {
        let (Some(target), Some(image)) = (job.outputs.first(), job.upstream.first()) else {
            return Err(SceneError::Generation("job has no image or output".to_string()));
        };

        let staged = staging_file(target)?;
        let request = VideoRequest {
            image: image.clone(),
            output: staged.path().to_path_buf(),
            fps: self.config.fps,
            motion_bucket: self.config.motion_bucket,
            frames: self.config.frames,
            noise_aug_strength: self.config.noise_aug_strength,
            seed: job.payload,
        };
        self.engine.animate(&request).await?;

        if tokio::fs::metadata(staged.path()).await?.len() == 0 {
            return Err(SceneError::Generation("engine wrote an empty clip".to_string()));
        }
        commit(staged, target)?;
        Ok(WorkResult::Generated)
    }
}

pub async fn animate_scenes<E: VideoEngine>(
    engine: &mut E,
    jobs: Vec<SceneJob<u64>>,
    config: &Config,
    options: StageOptions,
) -> StageReport {
    let mut worker = VideoWorker::new(engine, config);
    run_stage(Stage::Video, &mut worker, jobs, options).await
}

/// # Errors
/// Fatal errors resolving the project, admitting the model or loading it.
pub async fn run(args: &ProjectArgs, config: &Config) -> Result<StageReport, StageError> {
    let manifest = ProjectManifest::resolve(args).await?;
    let scenes = manifest.load_scenes().await?;
    let paths = manifest.paths();
    let options = args.stage_options();

    let images = source_images(&paths.images_dir()).await?;
    let jobs = plan_jobs(&paths, &scenes, &images, config);

    if pending_work(&jobs, options).await == 0 {
        tracing::info!("no clip to generate, not loading the model");
        return Ok(run_stage(Stage::Video, &mut NoModel::default(), jobs, options).await);
    }

    let mut manager = ResourceManager::new(config.resources.telemetry(), config.resources.policy());
    let request = SlotRequest::new(
        "video model",
        config.model_memory_mb.saturating_mul(MIB),
    );

    manager
        .scoped(
            request,
            async || {
                EngineProcess::spawn(
                    &config.engine,
                    Duration::from_secs(config.load_timeout_secs),
                    Duration::from_secs(config.request_timeout_secs),
                )
                .await
                .map_err(StageError::from)
            },
            async move |engine: &mut EngineProcess| {
                Ok(animate_scenes(engine, jobs, config, options).await)
            },
        )
        .await
}
