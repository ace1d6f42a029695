//! Plumbing shared by every storyreel stage binary: configuration, logging,
//! the project layout on disk, the per-scene stage loop and the child
//! process protocol used to talk to model engines.

use std::process::ExitCode;

pub mod cli;
pub mod config;
pub mod engine;
mod error;
pub mod logging;
pub mod manifest;
pub mod stage;

pub use config::StageConfig;
pub use error::{SceneError, StageError};
pub use manifest::{AssetKind, AssetPaths, ProjectManifest};
pub use stage::{
    NoModel, SceneJob, SceneOutcome, SceneWorker, SkipReason, Stage,
    StageOptions, StageReport, WorkResult, pending_work, run_stage,
};

/// Load the stage configuration and install logging in the format it asks
/// for.
///
/// # Errors
/// If the configuration cannot be extracted. Logging is still installed,
/// with the default format, so the error can be reported.
pub fn initialize<C: StageConfig>() -> Result<C, StageError> {
    match config::load::<C>() {
        Ok(config) => {
            logging::init(config.log_format());
            Ok(config)
        }
        Err(err) => {
            logging::init(logging::LogFormat::default());
            Err(err)
        }
    }
}

/// Turn the result of a stage run into the process exit status.
///
/// A run that finished with some failed scenes still exits successfully;
/// only errors that stopped the stage as a whole are fatal.
pub fn exit_code(stage: Stage, result: Result<StageReport, StageError>) -> ExitCode {
    match result {
        Ok(report) => {
            if report.failed > 0 {
                for (scene_id, reason) in &report.failures {
                    tracing::warn!(scene = scene_id, "{stage} failed: {reason}");
                }
            }
            tracing::info!(
                stage = %stage,
                total = report.total,
                generated = report.generated,
                skipped = report.skipped,
                failed = report.failed,
                "stage finished"
            );
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(stage = %stage, "fatal: {err}");
            eprintln!("fatal: {stage}: {err}");
            ExitCode::FAILURE
        }
    }
}
