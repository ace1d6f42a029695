//! The per-scene loop every stage runs.
//!
//! A stage turns the scene list into jobs, one per scene, each naming the
//! files it will produce and the upstream files it needs. `run_stage` then
//! works through the jobs in ascending scene order:
//!
//! - a job whose outputs all exist is skipped (unless skipping is off), so a
//!   re-run after a crash only redoes the missing work;
//! - a job whose upstream asset is missing fails with that path;
//! - a failed job is recorded and the loop moves on to the next scene.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tempfile::NamedTempFile;
use types::SceneId;

use crate::SceneError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    Audio,
    Image,
    Video,
    Merge,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Script => "script generation",
            Self::Audio => "audio generation",
            Self::Image => "image generation",
            Self::Video => "video generation",
            Self::Merge => "scene merge",
            Self::Assemble => "assembly",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    OutputExists,
    EmptyNarration,
    Unprobeable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutputExists => f.write_str("output already exists"),
            Self::EmptyNarration => f.write_str("scene has no narration"),
            Self::Unprobeable(reason) => write!(f, "input could not be probed: {reason}"),
        }
    }
}

/// One scene's worth of work for a stage.
#[derive(Debug, Clone)]
pub struct SceneJob<P> {
    pub scene_id: SceneId,
    /// Files this job writes. All of them existing means the job is done.
    pub outputs: Vec<PathBuf>,
    /// Files from earlier stages this job reads.
    pub upstream: Vec<PathBuf>,
    /// Set when planning already knows the scene has nothing to do.
    pub skip: Option<SkipReason>,
    pub payload: P,
}

impl<P> SceneJob<P> {
    pub const fn new(scene_id: SceneId, payload: P) -> Self {
        Self {
            scene_id,
            outputs: Vec::new(),
            upstream: Vec::new(),
            skip: None,
            payload,
        }
    }

    #[must_use]
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    #[must_use]
    pub fn upstream(mut self, path: impl Into<PathBuf>) -> Self {
        self.upstream.push(path.into());
        self
    }

    #[must_use]
    pub fn skip_because(mut self, reason: SkipReason) -> Self {
        self.skip = Some(reason);
        self
    }
}

pub enum WorkResult {
    Generated,
    Skipped(SkipReason),
}

/// Does the actual generation for a stage.
pub trait SceneWorker {
    type Payload;

    /// Produce every output of `job`.
    fn generate(
        &mut self,
        job: &SceneJob<Self::Payload>,
    ) -> impl Future<Output = Result<WorkResult, SceneError>>;

    /// Pause between two consecutive `generate` calls.
    fn cooldown(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOptions {
    pub skip_existing: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            skip_existing: true,
        }
    }
}

#[derive(Debug)]
pub enum SceneOutcome {
    Generated,
    Skipped(SkipReason),
    Failed(SceneError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub total: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<(SceneId, String)>,
}

impl StageReport {
    pub const fn new(stage: Stage, total: usize) -> Self {
        Self {
            stage,
            total,
            generated: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, scene_id: SceneId, outcome: &SceneOutcome) {
        match outcome {
            SceneOutcome::Generated => self.generated += 1,
            SceneOutcome::Skipped(_) => self.skipped += 1,
            SceneOutcome::Failed(err) => {
                self.failed += 1;
                self.failures.push((scene_id, err.to_string()));
            }
        }
    }

    /// Scenes whose outputs are present after the run.
    pub const fn complete(&self) -> usize {
        self.generated + self.skipped
    }
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} scenes ok ({} generated, {} skipped, {} failed)",
            self.stage,
            self.complete(),
            self.total,
            self.generated,
            self.skipped,
            self.failed
        )
    }
}

/// Run `worker` over `jobs` in ascending scene order.
pub async fn run_stage<W: SceneWorker>(
    stage: Stage,
    worker: &mut W,
    mut jobs: Vec<SceneJob<W::Payload>>,
    options: StageOptions,
) -> StageReport {
    jobs.sort_by_key(|job| job.scene_id);

    let total = jobs.len();
    let mut report = StageReport::new(stage, total);
    let mut worked = false;

    tracing::info!(stage = %stage, scenes = total, "starting stage");

    for (position, job) in jobs.iter().enumerate() {
        let outcome = run_job(worker, job, options, &mut worked).await;

        match &outcome {
            SceneOutcome::Generated => {
                tracing::info!(
                    scene = job.scene_id,
                    "[{}/{total}] generated",
                    position + 1
                );
            }
            SceneOutcome::Skipped(reason) => {
                tracing::info!(
                    scene = job.scene_id,
                    "[{}/{total}] skipped: {reason}",
                    position + 1
                );
            }
            SceneOutcome::Failed(err) => {
                tracing::error!(
                    scene = job.scene_id,
                    "[{}/{total}] failed: {err}",
                    position + 1
                );
            }
        }

        report.record(job.scene_id, &outcome);
    }

    report
}

// Outcome decided without calling the worker, if any.
async fn precheck<P>(job: &SceneJob<P>, options: StageOptions) -> Option<SceneOutcome> {
    if let Some(reason) = &job.skip {
        return Some(SceneOutcome::Skipped(reason.clone()));
    }

    if options.skip_existing && !job.outputs.is_empty() && all_exist(&job.outputs).await {
        return Some(SceneOutcome::Skipped(SkipReason::OutputExists));
    }

    for path in &job.upstream {
        if !exists(path).await {
            return Some(SceneOutcome::Failed(SceneError::MissingUpstreamAsset {
                path: path.clone(),
            }));
        }
    }

    None
}

/// Number of jobs that would reach the worker. Stages backed by a model use
/// this to avoid loading it when there is nothing to generate.
pub async fn pending_work<P>(jobs: &[SceneJob<P>], options: StageOptions) -> usize {
    let mut pending = 0;
    for job in jobs {
        if precheck(job, options).await.is_none() {
            pending += 1;
        }
    }
    pending
}

/// Worker for a run where `pending_work` was zero.
pub struct NoModel<P>(PhantomData<P>);

impl<P> Default for NoModel<P> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<P> SceneWorker for NoModel<P> {
    type Payload = P;

    async fn generate(&mut self, _job: &SceneJob<P>) -> Result<WorkResult, SceneError> {
        Err(SceneError::Generation("no model loaded".to_string()))
    }
}

async fn run_job<W: SceneWorker>(
    worker: &mut W,
    job: &SceneJob<W::Payload>,
    options: StageOptions,
    worked: &mut bool,
) -> SceneOutcome {
    if let Some(outcome) = precheck(job, options).await {
        return outcome;
    }

    if *worked {
        if let Some(pause) = worker.cooldown() {
            tokio::time::sleep(pause).await;
        }
    }
    *worked = true;

    match worker.generate(job).await {
        Ok(WorkResult::Generated) => SceneOutcome::Generated,
        Ok(WorkResult::Skipped(reason)) => SceneOutcome::Skipped(reason),
        Err(err) => SceneOutcome::Failed(err),
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn all_exist(paths: &[PathBuf]) -> bool {
    for path in paths {
        if !exists(path).await {
            return false;
        }
    }
    true
}

/// Temporary file next to `target`, with the same extension, to write into
/// before `commit`. Dropping it without committing deletes it, so a failed
/// write never leaves a file that a later run would mistake for finished
/// output.
///
/// # Errors
/// Returns an error if the directory cannot be created or written.
pub fn staging_file(target: &Path) -> Result<NamedTempFile, std::io::Error> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let suffix = target
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(&suffix)
        .tempfile_in(dir)
}

/// Move a finished staging file onto its final name.
///
/// # Errors
/// Returns an error if the rename fails.
pub fn commit(staged: NamedTempFile, target: &Path) -> Result<(), std::io::Error> {
    staged.persist(target).map(drop).map_err(|err| err.error)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    // Writes each output, failing for the scene ids in `fail`.
    #[derive(Default)]
    struct FileWorker {
        fail: HashSet<SceneId>,
        calls: Vec<SceneId>,
        cooldown: Option<Duration>,
    }

    impl SceneWorker for FileWorker {
        type Payload = ();

        async fn generate(&mut self, job: &SceneJob<()>) -> Result<WorkResult, SceneError> {
            self.calls.push(job.scene_id);
            if self.fail.contains(&job.scene_id) {
                return Err(SceneError::Generation("engine crashed".to_string()));
            }
            for output in &job.outputs {
                let staged = staging_file(output)?;
                std::fs::write(staged.path(), b"data")?;
                commit(staged, output)?;
            }
            Ok(WorkResult::Generated)
        }

        fn cooldown(&self) -> Option<Duration> {
            self.cooldown
        }
    }

    fn jobs(dir: &Path, ids: impl IntoIterator<Item = SceneId>) -> Vec<SceneJob<()>> {
        ids.into_iter()
            .map(|id| SceneJob::new(id, ()).output(dir.join(format!("scene_{id:02}.out"))))
            .collect()
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = FileWorker::default();

        let first = run_stage(
            Stage::Audio,
            &mut worker,
            jobs(dir.path(), 1..=3),
            StageOptions::default(),
        )
        .await;
        assert_eq!(first.generated, 3);
        assert_eq!(worker.calls, vec![1, 2, 3]);

        let mut worker = FileWorker::default();
        let second = run_stage(
            Stage::Audio,
            &mut worker,
            jobs(dir.path(), 1..=3),
            StageOptions::default(),
        )
        .await;
        assert_eq!(second.skipped, 3);
        assert_eq!(second.generated, 0);
        assert!(worker.calls.is_empty());
    }

    #[tokio::test]
    async fn test_no_skip_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = FileWorker::default();
        run_stage(
            Stage::Image,
            &mut worker,
            jobs(dir.path(), 1..=2),
            StageOptions::default(),
        )
        .await;

        let mut worker = FileWorker::default();
        let report = run_stage(
            Stage::Image,
            &mut worker,
            jobs(dir.path(), 1..=2),
            StageOptions {
                skip_existing: false,
            },
        )
        .await;
        assert_eq!(report.generated, 2);
        assert_eq!(worker.calls, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = FileWorker {
            fail: HashSet::from([3]),
            ..FileWorker::default()
        };

        let report = run_stage(
            Stage::Video,
            &mut worker,
            jobs(dir.path(), 1..=6),
            StageOptions::default(),
        )
        .await;

        assert_eq!(worker.calls, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(report.generated, 5);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].0, 3);
        assert!(!dir.path().join("scene_03.out").exists());
        assert!(dir.path().join("scene_04.out").exists());
        assert_eq!(
            report.to_string(),
            "video generation: 5/6 scenes ok (5 generated, 0 skipped, 1 failed)"
        );
    }

    #[tokio::test]
    async fn test_missing_upstream_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("scene_02_var_01.png");
        let job = SceneJob::new(2, ())
            .output(dir.path().join("scene_02.mp4"))
            .upstream(&missing);
        let mut worker = FileWorker::default();

        let report = run_stage(Stage::Video, &mut worker, vec![job], StageOptions::default()).await;

        assert!(worker.calls.is_empty());
        assert_eq!(report.failed, 1);
        assert!(report.failures[0].1.contains(&missing.display().to_string()));
    }

    #[tokio::test]
    async fn test_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = FileWorker::default();

        run_stage(
            Stage::Merge,
            &mut worker,
            jobs(dir.path(), [10, 2, 11, 1, 3, 4, 5, 6, 7, 8, 9]),
            StageOptions::default(),
        )
        .await;

        assert_eq!(worker.calls, (1..=11).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_planned_skip() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = FileWorker::default();
        let mut planned = jobs(dir.path(), 1..=2);
        planned[1] = SceneJob::new(2, ()).skip_because(SkipReason::EmptyNarration);

        let report = run_stage(Stage::Audio, &mut worker, planned, StageOptions::default()).await;

        assert_eq!(worker.calls, vec![1]);
        assert_eq!(report.generated, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_cooldown_between_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = FileWorker {
            cooldown: Some(Duration::from_millis(50)),
            ..FileWorker::default()
        };

        let started = std::time::Instant::now();
        run_stage(
            Stage::Audio,
            &mut worker,
            jobs(dir.path(), 1..=3),
            StageOptions::default(),
        )
        .await;

        // two pauses: none before the first call
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_pending_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = FileWorker::default();
        run_stage(
            Stage::Image,
            &mut worker,
            jobs(dir.path(), 1..=2),
            StageOptions::default(),
        )
        .await;

        let mut planned = jobs(dir.path(), 1..=4);
        planned[2] = SceneJob::new(3, ()).skip_because(SkipReason::EmptyNarration);
        planned[3] = SceneJob::new(4, ())
            .output(dir.path().join("scene_04.out"))
            .upstream(dir.path().join("missing.png"));

        assert_eq!(pending_work(&planned, StageOptions::default()).await, 0);
        assert_eq!(
            pending_work(&planned, StageOptions { skip_existing: false }).await,
            2
        );

        let report = run_stage(
            Stage::Image,
            &mut NoModel::default(),
            planned,
            StageOptions::default(),
        )
        .await;
        assert_eq!((report.skipped, report.failed), (3, 1));
    }

    #[test]
    fn test_dropped_staging_file_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/scene_01.mp4");
        {
            let staged = staging_file(&target).unwrap();
            assert_eq!(staged.path().extension().unwrap(), "mp4");
        }
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 0);
    }
}
