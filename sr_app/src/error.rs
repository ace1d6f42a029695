use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::engine::EngineError;

/// Failure of a single scene. Recorded in the stage report, never fatal.
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("missing upstream asset {}", .path.display())]
    MissingUpstreamAsset { path: PathBuf },
    #[error("generation failed: {0}")]
    Generation(String),
    #[error(transparent)]
    Ffmpeg(#[from] sr_ffmpeg::FfmpegError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop a stage before or instead of processing its scenes.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error("required input {} does not exist", .path.display())]
    MissingInput { path: PathBuf },
    #[error("invalid scene data: {0}")]
    Schema(#[from] types::SchemaError),
    #[error(transparent)]
    Resource(#[from] sr_gpu::ResourceError),
    #[error("no scene clips found in {}", .dir.display())]
    MissingClips { dir: PathBuf },
    #[error("{} clip(s) have no audio track, first: {}", .clips.len(), first_path(.clips))]
    ClipsWithoutAudio { clips: Vec<PathBuf> },
    #[error(transparent)]
    Ffmpeg(#[from] sr_ffmpeg::FfmpegError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("text generation failed: {0}")]
    TextGeneration(String),
    #[error("no usable scenes after {attempts} attempt(s): {reason}")]
    NoScenes { attempts: u32, reason: String },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn first_path(paths: &[PathBuf]) -> String {
    paths
        .first()
        .map(|path| path.display().to_string())
        .unwrap_or_default()
}

impl StageError {
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
