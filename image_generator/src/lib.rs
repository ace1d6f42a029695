//! Stage 3: keyframe images for every scene, `variations` per scene.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sr_app::cli::ProjectArgs;
use sr_app::config::ResourceConfig;
use sr_app::engine::{EngineCommand, EngineProcess};
use sr_app::logging::LogFormat;
use sr_app::stage::{commit, staging_file};
use sr_app::{
    AssetKind, AssetPaths, NoModel, ProjectManifest, SceneError, SceneJob,
    SceneWorker, Stage, StageConfig, StageError, StageOptions, StageReport,
    WorkResult, pending_work, run_stage,
};
use sr_gpu::{MIB, ResourceManager, SlotRequest};
use types::{
    DEFAULT_NEGATIVE_PROMPT, ImagePrompt, ProjectScenes, PromptFormatter,
    SceneId, StyledPromptFormatter,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub variations: u32,
    /// Base seed. Each image uses `seed + scene_id * 1000 + variation`.
    pub seed: u64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub prompt: StyledPromptFormatter,
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
            variations: 1,
            seed: 42,
            steps: 4,
            width: 1024,
            height: 576,
            prompt: StyledPromptFormatter {
                style_prefix: "cinematic film still".to_string(),
                quality_tags: "4k, ultra detailed, volumetric lighting".to_string(),
                style_suffix: String::new(),
                negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            },
            engine: EngineCommand::new("storyreel-image-engine", Vec::<String>::new()),
            load_timeout_secs: 600,
            request_timeout_secs: 300,
            model_memory_mb: 12 * 1024,
            resources: ResourceConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl StageConfig for Config {
    const SECTION: &'static str = "image";

    fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

pub fn seed_for(base: u64, scene_id: SceneId, variation: u32) -> u64 {
    base.wrapping_add(u64::from(scene_id) * 1000)
        .wrapping_add(u64::from(variation))
}

/// One image as sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub output: PathBuf,
    pub seed: u64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
}

/// Text-to-image capability.
pub trait ImageEngine {
    /// Render one image to `request.output`.
    fn render(&mut self, request: &ImageRequest) -> impl Future<Output = Result<(), SceneError>>;
}

impl ImageEngine for EngineProcess {
    async fn render(&mut self, request: &ImageRequest) -> Result<(), SceneError> {
        self.request(request).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub prompt: ImagePrompt,
    pub seeds: Vec<u64>,
}

/// One job per scene, one output per variation.
pub fn plan_jobs(
    paths: &AssetPaths,
    scenes: &ProjectScenes,
    formatter: &impl PromptFormatter,
    config: &Config,
) -> Vec<SceneJob<ImagePayload>> {
    let variations = config.variations.max(1);

    scenes
        .scenes()
        .iter()
        .map(|scene| {
            let payload = ImagePayload {
                prompt: formatter.format(scene),
                seeds: (1..=variations)
                    .map(|variation| seed_for(config.seed, scene.scene_id, variation))
                    .collect(),
            };
            (1..=variations).fold(SceneJob::new(scene.scene_id, payload), |job, variation| {
                job.output(paths.asset(AssetKind::Image { variation }, scene.scene_id))
            })
        })
        .collect()
}

pub struct ImageWorker<'a, E> {
    engine: &'a mut E,
    config: &'a Config,
    skip_existing: bool,
}

impl<'a, E: ImageEngine> ImageWorker<'a, E> {
    pub const fn new(engine: &'a mut E, config: &'a Config, options: StageOptions) -> Self {
        Self {
            engine,
            config,
            skip_existing: options.skip_existing,
        }
    }

    async fn render_one(
        &mut self,
        payload: &ImagePayload,
        seed: u64,
        target: &Path,
    ) -> Result<(), SceneError> {
        let staged = staging_file(target)?;
        let request = ImageRequest {
            prompt: payload.prompt.positive.clone(),
            negative_prompt: payload.prompt.negative.clone(),
            output: staged.path().to_path_buf(),
            seed,
            steps: self.config.steps,
            width: self.config.width,
            height: self.config.height,
        };
        self.engine.render(&request).await?;

        if tokio::fs::metadata(staged.path()).await?.len() == 0 {
            return Err(SceneError::Generation(format!(
                "engine wrote no image for {}",
                target.display()
            )));
        }
        commit(staged, target)?;
        Ok(())
    }
}

impl<E: ImageEngine> SceneWorker for ImageWorker<'_, E> {
    type Payload = ImagePayload;

    async fn generate(&mut self, job: &SceneJob<ImagePayload>) -> Result<WorkResult, SceneError> {
        tracing::debug!(scene = job.scene_id, "prompt: {}", job.payload.prompt.positive);

        for (target, seed) in job.outputs.iter().zip(&job.payload.seeds) {
            if self.skip_existing && tokio::fs::try_exists(target).await.unwrap_or(false) {
                continue;
            }
            self.render_one(&job.payload, *seed, target).await?;
        }
        Ok(WorkResult::Generated)
    }
}

/// Render every scene of a loaded project with an already running engine.
pub async fn render_scenes<E: ImageEngine>(
    engine: &mut E,
    jobs: Vec<SceneJob<ImagePayload>>,
    config: &Config,
    options: StageOptions,
) -> StageReport {
    let mut worker = ImageWorker::new(engine, config, options);
    run_stage(Stage::Image, &mut worker, jobs, options).await
}

/// # Errors
/// Fatal errors resolving the project, admitting the model or loading it.
pub async fn run(args: &ProjectArgs, config: &Config) -> Result<StageReport, StageError> {
    let manifest = ProjectManifest::resolve(args).await?;
    let scenes = manifest.load_scenes().await?;
    let options = args.stage_options();
    let jobs = plan_jobs(&manifest.paths(), &scenes, &config.prompt, config);

    if pending_work(&jobs, options).await == 0 {
        tracing::info!("every image already exists, not loading the model");
        return Ok(run_stage(Stage::Image, &mut NoModel::default(), jobs, options).await);
    }

    let mut manager = ResourceManager::new(config.resources.telemetry(), config.resources.policy());
    let request = SlotRequest::new(
        "image model",
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
                Ok(render_scenes(engine, jobs, config, options).await)
            },
        )
        .await
}

#[cfg(test)]
mod test {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct FakeEngine {
        requests: Vec<ImageRequest>,
    }

    impl ImageEngine for FakeEngine {
        async fn render(&mut self, request: &ImageRequest) -> Result<(), SceneError> {
            self.requests.push(request.clone());
            tokio::fs::write(&request.output, b"\x89PNG").await?;
            Ok(())
        }
    }

    async fn project(dir: &Path) -> (ProjectManifest, ProjectScenes) {
        let created_at = NaiveDate::from_ymd_opt(2025, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let manifest = ProjectManifest::create(dir, "coffee", created_at).await.unwrap();
        std::fs::write(
            manifest.paths().scenes_file(),
            r#"[
                {"scene_id": 1, "visual_subject": "a barista", "visual_action": "pouring milk",
                 "background_environment": "a small cafe", "lighting": "morning sun",
                 "camera_shot": "close-up", "audio_text": "One.", "duration": 8},
                {"scene_id": 2, "visual_prompt": "beans drying in the sun", "audio_text": "", "duration": 8}
            ]"#,
        )
        .unwrap();
        let scenes = manifest.load_scenes().await.unwrap();
        (manifest, scenes)
    }

    #[test]
    fn test_seed_for() {
        assert_eq!(seed_for(42, 1, 1), 1043);
        assert_eq!(seed_for(42, 3, 2), 3044);
    }

    #[tokio::test]
    async fn test_variations_and_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, scenes) = project(dir.path()).await;
        let config = Config {
            variations: 2,
            ..Config::default()
        };
        let jobs = plan_jobs(&manifest.paths(), &scenes, &config.prompt, &config);

        let mut engine = FakeEngine::default();
        let report = render_scenes(&mut engine, jobs, &config, StageOptions::default()).await;

        assert_eq!(report.generated, 2);
        let seeds: Vec<u64> = engine.requests.iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![1043, 1044, 2043, 2044]);
        assert_eq!(
            engine.requests[0].prompt,
            "cinematic film still, a barista pouring milk, a small cafe, morning sun, close-up, 4k, ultra detailed, volumetric lighting"
        );
        assert_eq!(
            engine.requests[2].prompt,
            "cinematic film still, beans drying in the sun, 4k, ultra detailed, volumetric lighting"
        );
        assert_eq!(engine.requests[0].negative_prompt, DEFAULT_NEGATIVE_PROMPT);

        let images = manifest.paths().images_dir();
        for name in [
            "scene_01_var_01.png",
            "scene_01_var_02.png",
            "scene_02_var_01.png",
            "scene_02_var_02.png",
        ] {
            assert!(images.join(name).is_file(), "{name} missing");
        }
    }

    #[tokio::test]
    async fn test_only_missing_variation_is_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, scenes) = project(dir.path()).await;
        let config = Config {
            variations: 2,
            ..Config::default()
        };
        let images = manifest.paths().images_dir();
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("scene_01_var_01.png"), b"old").unwrap();

        let jobs = plan_jobs(&manifest.paths(), &scenes, &config.prompt, &config);
        let mut engine = FakeEngine::default();
        render_scenes(&mut engine, jobs, &config, StageOptions::default()).await;

        let seeds: Vec<u64> = engine.requests.iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![1044, 2043, 2044]);
        assert_eq!(std::fs::read(images.join("scene_01_var_01.png")).unwrap(), b"old");
    }
}
