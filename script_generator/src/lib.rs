//! Stage 1: topic in, validated scene list and a new project directory out.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sr_app::config::ResourceConfig;
use sr_app::logging::LogFormat;
use sr_app::{ProjectManifest, Stage, StageConfig, StageError, StageOptions, StageReport};
use sr_gpu::{MIB, ResourceManager, SlotRequest};
use types::{ProjectScenes, SchemaError, extract_scene_candidates, fallback_scenes, validate};

pub mod director;
pub mod llm;

use llm::{EngineText, HttpChat, LlmBackend, LlmConfig, LlmError, TextGenerator};

/// What to do when the model never produces a usable storyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Write the built-in generic scenes and carry on.
    #[default]
    Generic,
    /// Stop with an error.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_scenes: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub fallback: FallbackPolicy,
    pub llm: LlmConfig,
    pub resources: ResourceConfig,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_scenes: 10,
            max_retries: 3,
            retry_delay_ms: 1000,
            fallback: FallbackPolicy::Generic,
            llm: LlmConfig::default(),
            resources: ResourceConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl StageConfig for Config {
    const SECTION: &'static str = "script";

    fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub scenes: ProjectScenes,
    pub attempts: u32,
    pub fallback_used: bool,
}

fn parse_storyboard(raw: &str, topic: &str) -> Result<ProjectScenes, SchemaError> {
    let candidates = extract_scene_candidates(raw)?;
    validate(&candidates, topic)
}

/// Ask `generator` for a storyboard until one validates, then apply the
/// fallback policy.
///
/// # Errors
/// `NoScenes` when every attempt failed and the policy is `Fail`.
pub async fn generate_scenes<G: TextGenerator>(
    generator: &mut G,
    topic: &str,
    config: &Config,
) -> Result<ScriptOutcome, StageError> {
    let attempts = config.max_retries.max(1);
    let prompt = director::user_prompt(topic, config.max_scenes);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        tracing::info!(attempt, "requesting storyboard for '{topic}'");

        let result = generator
            .generate(director::SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|err: LlmError| err.to_string())
            .and_then(|raw| {
                tracing::debug!("model output: {raw}");
                parse_storyboard(&raw, topic).map_err(|err| err.to_string())
            });

        match result {
            Ok(scenes) => {
                return Ok(ScriptOutcome {
                    scenes: scenes.limit(config.max_scenes),
                    attempts: attempt,
                    fallback_used: false,
                });
            }
            Err(reason) => {
                tracing::warn!(attempt, "unusable storyboard: {reason}");
                last_error = reason;
            }
        }

        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
        }
    }

    match config.fallback {
        FallbackPolicy::Generic => {
            tracing::warn!(
                "no usable storyboard after {attempts} attempt(s), writing generic scenes"
            );
            Ok(ScriptOutcome {
                scenes: fallback_scenes(topic).limit(config.max_scenes),
                attempts,
                fallback_used: true,
            })
        }
        FallbackPolicy::Fail => Err(StageError::NoScenes {
            attempts,
            reason: last_error,
        }),
    }
}

async fn storyboard(topic: &str, config: &Config) -> Result<ScriptOutcome, StageError> {
    let llm = &config.llm;
    match llm.backend {
        LlmBackend::Http => {
            let api_key = std::env::var(&llm.api_key_env).ok();
            let mut chat = HttpChat::new(llm, api_key.as_deref())
                .map_err(|err| StageError::TextGeneration(err.to_string()))?;
            generate_scenes(&mut chat, topic, config).await
        }
        LlmBackend::Engine => {
            let mut manager =
                ResourceManager::new(config.resources.telemetry(), config.resources.policy());
            let request = SlotRequest::new(
                format!("text model {}", llm.model),
                llm.model_memory_mb.saturating_mul(MIB),
            );

            manager
                .scoped(
                    request,
                    async || {
                        EngineText::spawn(llm)
                            .await
                            .map_err(|err| StageError::TextGeneration(err.to_string()))
                    },
                    async |engine: &mut EngineText| generate_scenes(engine, topic, config).await,
                )
                .await
        }
    }
}

/// Write the scenes file and manifest of a new project.
///
/// # Errors
/// If the project directory or its files cannot be written.
pub async fn write_project(
    output_base: &Path,
    topic: &str,
    now: NaiveDateTime,
    outcome: &ScriptOutcome,
    text_model: &str,
    elapsed: Duration,
) -> Result<ProjectManifest, StageError> {
    let mut manifest = ProjectManifest::create(output_base, topic, now).await?;

    let scenes_file = manifest.paths().scenes_file();
    tokio::fs::write(&scenes_file, outcome.scenes.to_json_pretty()?)
        .await
        .map_err(StageError::io(&scenes_file))?;

    manifest.generation.text_model = Some(text_model.to_string());
    manifest.generation.scenes_generated = outcome.scenes.len();
    manifest.generation.fallback_used = outcome.fallback_used;
    manifest.generation.script_seconds = elapsed.as_secs_f64();
    manifest.save().await?;

    tracing::info!(
        scenes = outcome.scenes.len(),
        "wrote {}",
        scenes_file.display()
    );
    Ok(manifest)
}

/// Reports of one topic's run.
#[derive(Debug)]
pub struct ScriptRun {
    pub manifest: ProjectManifest,
    pub script: StageReport,
    pub audio: Option<StageReport>,
}

/// Newest project for `topic` whose scenes file loads, if any.
async fn existing_project(
    output_base: &Path,
    topic: &str,
) -> Option<(ProjectManifest, ProjectScenes)> {
    let manifest = ProjectManifest::discover(output_base, topic).await.ok()?;
    match manifest.load_scenes().await {
        Ok(scenes) => Some((manifest, scenes)),
        Err(err) => {
            tracing::warn!("not reusing {}: {err}", manifest.root().display());
            None
        }
    }
}

/// Generate one project for `topic`, optionally narrating it straight away.
///
/// When `options.skip_existing` is set and a project for the topic already
/// has its scenes, that project is reused and only missing narration is
/// generated.
///
/// # Errors
/// Any fatal error from generation or from writing the project.
pub async fn run_topic(
    topic: &str,
    output_base: &Path,
    config: &Config,
    audio: Option<&audio_generator::Config>,
    options: StageOptions,
    now: NaiveDateTime,
) -> Result<ScriptRun, StageError> {
    let existing = if options.skip_existing {
        existing_project(output_base, topic).await
    } else {
        None
    };
    if let Some((manifest, scenes)) = existing {
        tracing::info!(
            "scenes already written in {}, skipping generation",
            manifest.root().display()
        );
        let script = StageReport {
            skipped: scenes.len(),
            ..StageReport::new(Stage::Script, scenes.len())
        };
        return with_narration(manifest, &scenes, script, audio, options).await;
    }

    let started = Instant::now();
    // any engine slot is released and reclaimed before this returns
    let outcome = storyboard(topic, config).await?;

    let manifest = write_project(
        output_base,
        topic,
        now,
        &outcome,
        &config.llm.model,
        started.elapsed(),
    )
    .await?;

    let count = outcome.scenes.len();
    let script = StageReport {
        generated: count,
        ..StageReport::new(Stage::Script, count)
    };

    with_narration(manifest, &outcome.scenes, script, audio, options).await
}

async fn with_narration(
    mut manifest: ProjectManifest,
    scenes: &ProjectScenes,
    script: StageReport,
    audio: Option<&audio_generator::Config>,
    options: StageOptions,
) -> Result<ScriptRun, StageError> {
    let Some(audio) = audio else {
        return Ok(ScriptRun {
            manifest,
            script,
            audio: None,
        });
    };

    let audio_started = Instant::now();
    let report = audio_generator::narrate(
        &manifest,
        scenes,
        audio_generator::CommandSynthesizer::from_config(audio),
        audio,
        options,
    )
    .await;

    manifest.generation.voice = Some(audio.voice.clone());
    manifest.generation.audio_files_generated = Some(report.generated);
    manifest.generation.audio_seconds = Some(audio_started.elapsed().as_secs_f64());
    manifest.save().await?;

    Ok(ScriptRun {
        manifest,
        script,
        audio: Some(report),
    })
}

/// Topics listed one per line; blank lines and surrounding space ignored.
pub fn parse_topics(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub projects: Vec<PathBuf>,
    pub failures: Vec<(String, String)>,
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "batch: {} of {} topics succeeded",
            self.projects.len(),
            self.projects.len() + self.failures.len()
        )?;
        for (topic, reason) in &self.failures {
            write!(f, "\n  failed '{topic}': {reason}")?;
        }
        Ok(())
    }
}

/// Run every topic as its own project. A failing topic is recorded and the
/// batch moves on.
pub async fn run_batch(
    topics: &[String],
    output_base: &Path,
    config: &Config,
    audio: Option<&audio_generator::Config>,
    options: StageOptions,
) -> BatchSummary {
    let mut summary = BatchSummary::default();

    for (position, topic) in topics.iter().enumerate() {
        tracing::info!("[{}/{}] topic '{topic}'", position + 1, topics.len());
        let now = chrono::Local::now().naive_local();

        match run_topic(topic, output_base, config, audio, options, now).await {
            Ok(run) => summary.projects.push(run.manifest.root().to_path_buf()),
            Err(err) => {
                tracing::error!("topic '{topic}' failed: {err}");
                summary.failures.push((topic.clone(), err.to_string()));
            }
        }
    }

    summary
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct ScriptedModel {
        replies: VecDeque<Result<String, LlmError>>,
        calls: u32,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<&str, LlmError>>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|reply| reply.map(str::to_string))
                    .collect(),
                calls: 0,
            }
        }
    }

    impl TextGenerator for ScriptedModel {
        async fn generate(&mut self, _system: &str, _user: &str) -> Result<String, LlmError> {
            self.calls += 1;
            self.replies.pop_front().unwrap_or(Err(LlmError::EmptyResponse))
        }
    }

    fn fast(fallback: FallbackPolicy) -> Config {
        Config {
            retry_delay_ms: 0,
            fallback,
            ..Config::default()
        }
    }

    const STORYBOARD: &str = r#"Here you go:
```json
[
  {"scene_id": 2, "visual_subject": "a roaster", "visual_action": "turning beans",
   "background_environment": "a warehouse", "lighting": "warm", "camera_shot": "close-up",
   "audio_text": "Roasting brings out the flavor.", "duration": 40},
  {"scene_id": 1, "visual_prompt": "goats on a hillside", "audio_text": "Legend starts with goats."},
]
```"#;

    #[tokio::test]
    async fn test_retries_until_valid() {
        let mut model = ScriptedModel::new(vec![
            Ok("I cannot help with that."),
            Err(LlmError::EmptyResponse),
            Ok(STORYBOARD),
        ]);

        let outcome = generate_scenes(&mut model, "coffee", &fast(FallbackPolicy::Fail))
            .await
            .unwrap();

        assert_eq!(model.calls, 3);
        assert_eq!(outcome.attempts, 3);
        assert!(!outcome.fallback_used);
        let ids: Vec<u32> = outcome.scenes.scenes().iter().map(|s| s.scene_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(outcome.scenes.scenes()[0].visual.visual_subject, "goats on a hillside");
        assert_eq!(outcome.scenes.scenes()[0].duration, 8);
        assert_eq!(outcome.scenes.scenes()[1].duration, 30);
    }

    #[tokio::test]
    async fn test_generic_fallback() {
        let mut model = ScriptedModel::new(vec![Ok("no"), Ok("still no"), Ok("[oops")]);

        let outcome = generate_scenes(&mut model, "coffee", &fast(FallbackPolicy::Generic))
            .await
            .unwrap();

        assert_eq!(model.calls, 3);
        assert!(outcome.fallback_used);
        assert_eq!(outcome.scenes, fallback_scenes("coffee"));
    }

    #[tokio::test]
    async fn test_fail_policy() {
        let mut model = ScriptedModel::new(vec![]);

        let result = generate_scenes(&mut model, "coffee", &fast(FallbackPolicy::Fail)).await;

        assert!(matches!(
            result,
            Err(StageError::NoScenes { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_max_scenes_keeps_lowest_ids() {
        let raw = serde_json::to_string(
            &(1..=12)
                .rev()
                .map(|id| {
                    serde_json::json!({"scene_id": id, "visual_prompt": "x", "audio_text": "y"})
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let mut model = ScriptedModel::new(vec![Ok(raw.as_str())]);

        let outcome = generate_scenes(&mut model, "coffee", &fast(FallbackPolicy::Fail))
            .await
            .unwrap();

        let ids: Vec<u32> = outcome.scenes.scenes().iter().map(|s| s.scene_id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_write_project_round_trips_through_validation() {
        let dir = tempfile::tempdir().unwrap();
        let now = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let mut model = ScriptedModel::new(vec![Ok(STORYBOARD)]);
        let outcome = generate_scenes(
            &mut model,
            "The History of Coffee",
            &fast(FallbackPolicy::Fail),
        )
        .await
        .unwrap();

        let manifest = write_project(
            dir.path(),
            "The History of Coffee",
            now,
            &outcome,
            "gpt-4o-mini",
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(manifest.project_id, "20250601_090000_the_history_of_coffee");
        assert!(
            manifest
                .root()
                .join("1_scripts/the_history_of_coffee_scenes.json")
                .is_file()
        );

        let reloaded = ProjectManifest::load(manifest.root()).await.unwrap();
        assert_eq!(reloaded.generation.scenes_generated, 2);
        assert_eq!(reloaded.generation.text_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(reloaded.load_scenes().await.unwrap(), outcome.scenes);
    }

    async fn coffee_project(dir: &Path) -> ProjectManifest {
        let now = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let mut model = ScriptedModel::new(vec![Ok(STORYBOARD)]);
        let outcome = generate_scenes(&mut model, "coffee", &fast(FallbackPolicy::Fail))
            .await
            .unwrap();
        write_project(dir, "coffee", now, &outcome, "m", Duration::ZERO)
            .await
            .unwrap()
    }

    fn http_config(server: &MockServer) -> Config {
        Config {
            llm: LlmConfig {
                base_url: format!("{}/v1", server.uri()),
                api_key_env: "STORYREEL_TEST_UNSET_KEY".to_string(),
                ..LlmConfig::default()
            },
            ..fast(FallbackPolicy::Fail)
        }
    }

    fn an_hour_later() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_existing_project_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = coffee_project(dir.path()).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let run = run_topic(
            "coffee",
            dir.path(),
            &http_config(&server),
            None,
            StageOptions::default(),
            an_hour_later(),
        )
        .await
        .unwrap();

        assert_eq!(run.manifest.root(), first.root());
        assert_eq!((run.script.generated, run.script.skipped), (0, 2));
    }

    #[tokio::test]
    async fn test_no_skip_writes_a_new_project() {
        let dir = tempfile::tempdir().unwrap();
        let first = coffee_project(dir.path()).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": STORYBOARD}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let run = run_topic(
            "coffee",
            dir.path(),
            &http_config(&server),
            None,
            StageOptions {
                skip_existing: false,
            },
            an_hour_later(),
        )
        .await
        .unwrap();

        assert_ne!(run.manifest.root(), first.root());
        assert_eq!(run.manifest.project_id, "20250601_100000_coffee");
        assert_eq!(run.script.generated, 2);
    }

    #[test]
    fn test_parse_topics() {
        assert_eq!(
            parse_topics("The history of coffee\n\n  Deep sea creatures  \n"),
            vec![
                "The history of coffee".to_string(),
                "Deep sea creatures".to_string()
            ]
        );
    }
}
