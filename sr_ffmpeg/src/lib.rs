use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;

pub mod concat;
pub mod encode;
pub mod merge;
pub mod probe;

pub use encode::EncodeProfile;

#[derive(Error, Debug)]
pub enum FfmpegError {
    #[error("{0} was not found on PATH")]
    ToolNotFound(&'static str),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("failed to parse ffprobe output for {}: {source}", .path.display())]
    ProbeParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} has no readable duration", .path.display())]
    NoDuration { path: PathBuf },
    #[error("{} has no video stream", .path.display())]
    NoVideoStream { path: PathBuf },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

// lines of ffmpeg stderr kept in an error
const STDERR_TAIL_LINES: usize = 20;

/// Check that `ffmpeg` and `ffprobe` are installed.
///
/// # Errors
/// Returns `FfmpegError::ToolNotFound` naming the missing binary.
pub fn check_tools() -> Result<(), FfmpegError> {
    which::which("ffmpeg").map_err(|_| FfmpegError::ToolNotFound("ffmpeg"))?;
    which::which("ffprobe").map_err(|_| FfmpegError::ToolNotFound("ffprobe"))?;
    Ok(())
}

/// Run a prepared ffmpeg command to completion.
///
/// # Errors
/// `Spawn` if the process cannot start, `Failed` with the tail of stderr if
/// it exits unsuccessfully.
pub async fn run(mut command: Command) -> Result<(), FfmpegError> {
    tracing::debug!(
        "running ffmpeg {}",
        command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| FfmpegError::Spawn {
            program: "ffmpeg",
            source,
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    tracing::trace!("ffmpeg output: {}", stderr);

    if !output.status.success() {
        return Err(FfmpegError::Failed {
            program: "ffmpeg",
            status: output.status,
            stderr: tail(&stderr, STDERR_TAIL_LINES),
        });
    }

    Ok(())
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Format seconds for ffmpeg arguments: millisecond precision, no trailing
/// zeros.
pub(crate) fn seconds(value: f64) -> String {
    let formatted = format!("{value:.3}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
