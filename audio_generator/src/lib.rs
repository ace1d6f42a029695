//! Stage 2: one narration file per scene, read from `audio_text`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sr_app::cli::ProjectArgs;
use sr_app::logging::LogFormat;
use sr_app::stage::{commit, staging_file};
use sr_app::{
    AssetKind, AssetPaths, ProjectManifest, SceneError, SceneJob, SceneWorker,
    SkipReason, Stage, StageError, StageOptions, StageReport, WorkResult,
    run_stage,
};
use tokio::process::Command;
use types::ProjectScenes;

pub const DEFAULT_VOICE: &str = "en-US-ChristopherNeural";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub voice: String,
    /// Pause between two synthesis calls.
    pub rate_limit_ms: u64,
    /// Synthesis command. `{voice}`, `{text}` and `{output}` are replaced in
    /// every argument.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            rate_limit_ms: 500,
            command: [
                "edge-tts",
                "--voice",
                "{voice}",
                "--text",
                "{text}",
                "--write-media",
                "{output}",
            ]
            .map(String::from)
            .to_vec(),
            timeout_secs: 120,
            log_format: LogFormat::default(),
        }
    }
}

impl sr_app::StageConfig for Config {
    const SECTION: &'static str = "audio";

    fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

/// Text-to-speech capability.
pub trait SpeechSynthesizer {
    /// Write the narration of `text` spoken by `voice` to `output`.
    fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        output: &Path,
    ) -> impl Future<Output = Result<(), SceneError>>;
}

impl<S: SpeechSynthesizer> SpeechSynthesizer for &mut S {
    fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        output: &Path,
    ) -> impl Future<Output = Result<(), SceneError>> {
        (**self).synthesize(text, voice, output)
    }
}

/// Runs an external TTS program once per scene.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    template: Vec<String>,
    timeout: Duration,
}

impl CommandSynthesizer {
    pub const fn new(template: Vec<String>, timeout: Duration) -> Self {
        Self { template, timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn render(&self, text: &str, voice: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.template
            .iter()
            .map(|arg| {
                arg.replace("{voice}", voice)
                    .replace("{output}", &output)
                    .replace("{text}", text)
            })
            .collect()
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    async fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        output: &Path,
    ) -> Result<(), SceneError> {
        let args = self.render(text, voice, output);
        let (program, args) = args.split_first().ok_or_else(|| {
            SceneError::Generation("synthesis command is empty".to_string())
        })?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let result = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                SceneError::Generation(format!(
                    "{program} did not finish within {:?}",
                    self.timeout
                ))
            })??;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(SceneError::Generation(format!(
                "{program} exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

/// Scene worker writing `scene_XX_audio.mp3`.
pub struct NarrationWorker<S> {
    synthesizer: S,
    voice: String,
    rate_limit: Duration,
}

impl<S: SpeechSynthesizer> NarrationWorker<S> {
    pub fn new(synthesizer: S, config: &Config) -> Self {
        Self {
            synthesizer,
            voice: config.voice.clone(),
            rate_limit: Duration::from_millis(config.rate_limit_ms),
        }
    }
}

impl<S: SpeechSynthesizer> SceneWorker for NarrationWorker<S> {
    type Payload = String;

    async fn generate(&mut self, job: &SceneJob<String>) -> Result<WorkResult, SceneError> {
        let Some(target) = job.outputs.first() else {
            return Err(SceneError::Generation("job has no output path".to_string()));
        };

        let staged = staging_file(target)?;
        self.synthesizer
            .synthesize(&job.payload, &self.voice, staged.path())
            .await?;

        let written = tokio::fs::metadata(staged.path()).await?.len();
        if written == 0 {
            return Err(SceneError::Generation(
                "synthesizer wrote an empty file".to_string(),
            ));
        }

        commit(staged, target)?;
        Ok(WorkResult::Generated)
    }

    fn cooldown(&self) -> Option<Duration> {
        (!self.rate_limit.is_zero()).then_some(self.rate_limit)
    }
}

/// One job per scene. Scenes without narration are skipped.
pub fn plan_jobs(paths: &AssetPaths, scenes: &ProjectScenes) -> Vec<SceneJob<String>> {
    scenes
        .scenes()
        .iter()
        .map(|scene| {
            let job = SceneJob::new(scene.scene_id, scene.audio_text.trim().to_string())
                .output(paths.asset(AssetKind::Audio, scene.scene_id));
            if scene.has_narration() {
                job
            } else {
                job.skip_because(SkipReason::EmptyNarration)
            }
        })
        .collect()
}

/// Narrate every scene of a loaded project.
pub async fn narrate<S: SpeechSynthesizer>(
    manifest: &ProjectManifest,
    scenes: &ProjectScenes,
    synthesizer: S,
    config: &Config,
    options: StageOptions,
) -> StageReport {
    tracing::info!(
        voice = %config.voice,
        scenes = scenes.len(),
        "narrating {}",
        manifest.project_id
    );

    let mut worker = NarrationWorker::new(synthesizer, config);
    let jobs = plan_jobs(&manifest.paths(), scenes);
    run_stage(Stage::Audio, &mut worker, jobs, options).await
}

/// # Errors
/// Any fatal error while resolving the project or reading its scenes.
pub async fn run(args: &ProjectArgs, config: &Config) -> Result<StageReport, StageError> {
    let manifest = ProjectManifest::resolve(args).await?;
    let scenes = manifest.load_scenes().await?;

    Ok(narrate(
        &manifest,
        &scenes,
        CommandSynthesizer::from_config(config),
        config,
        args.stage_options(),
    )
    .await)
}

#[cfg(test)]
mod test {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct FakeSynthesizer {
        spoken: Vec<(String, String)>,
    }

    impl SpeechSynthesizer for FakeSynthesizer {
        async fn synthesize(
            &mut self,
            text: &str,
            voice: &str,
            output: &Path,
        ) -> Result<(), SceneError> {
            self.spoken.push((text.to_string(), voice.to_string()));
            tokio::fs::write(output, b"ID3").await?;
            Ok(())
        }
    }

    async fn project(dir: &Path, scenes_json: &str) -> (ProjectManifest, ProjectScenes) {
        let created_at = NaiveDate::from_ymd_opt(2025, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let manifest = ProjectManifest::create(dir, "coffee", created_at).await.unwrap();
        std::fs::write(manifest.paths().scenes_file(), scenes_json).unwrap();
        let scenes = manifest.load_scenes().await.unwrap();
        (manifest, scenes)
    }

    fn quiet() -> Config {
        Config {
            rate_limit_ms: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_empty_narration_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, scenes) = project(
            dir.path(),
            r#"[
                {"scene_id": 1, "visual_prompt": "a cup", "audio_text": "Coffee began in Ethiopia.", "duration": 8},
                {"scene_id": 2, "visual_prompt": "a field", "audio_text": "", "duration": 8}
            ]"#,
        )
        .await;

        let mut fake = FakeSynthesizer::default();
        let report =
            narrate(&manifest, &scenes, &mut fake, &quiet(), StageOptions::default()).await;

        assert_eq!((report.generated, report.skipped, report.failed), (1, 1, 0));
        let audio_dir = manifest.paths().audio_dir();
        let files: Vec<String> = std::fs::read_dir(&audio_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files, vec!["scene_01_audio.mp3".to_string()]);
        assert_eq!(
            fake.spoken,
            vec![(
                "Coffee began in Ethiopia.".to_string(),
                DEFAULT_VOICE.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_rerun_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, scenes) = project(
            dir.path(),
            r#"[
                {"scene_id": 1, "visual_prompt": "a", "audio_text": "One.", "duration": 8},
                {"scene_id": 2, "visual_prompt": "b", "audio_text": "Two.", "duration": 8}
            ]"#,
        )
        .await;

        let mut fake = FakeSynthesizer::default();
        narrate(&manifest, &scenes, &mut fake, &quiet(), StageOptions::default()).await;
        assert_eq!(fake.spoken.len(), 2);

        let mut fake = FakeSynthesizer::default();
        let report =
            narrate(&manifest, &scenes, &mut fake, &quiet(), StageOptions::default()).await;
        assert!(fake.spoken.is_empty());
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_command_synthesizer_substitutes_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");
        let mut synthesizer = CommandSynthesizer::new(
            [
                "sh",
                "-c",
                r#"printf '%s|%s' "$1" "$2" > "$3""#,
                "sh",
                "{voice}",
                "{text}",
                "{output}",
            ]
            .map(String::from)
            .to_vec(),
            Duration::from_secs(5),
        );

        synthesizer
            .synthesize("Hello there", "en-GB-RyanNeural", &output)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "en-GB-RyanNeural|Hello there"
        );
    }

    #[tokio::test]
    async fn test_failing_command_fails_only_that_scene() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, scenes) = project(
            dir.path(),
            r#"[{"scene_id": 1, "visual_prompt": "a", "audio_text": "One.", "duration": 8}]"#,
        )
        .await;
        let synthesizer = CommandSynthesizer::new(
            ["sh", "-c", "echo no voices >&2; exit 2"].map(String::from).to_vec(),
            Duration::from_secs(5),
        );

        let report =
            narrate(&manifest, &scenes, synthesizer, &quiet(), StageOptions::default()).await;

        assert_eq!(report.failed, 1);
        assert!(report.failures[0].1.contains("no voices"));
        assert!(!manifest.paths().asset(AssetKind::Audio, 1).exists());
    }
}
