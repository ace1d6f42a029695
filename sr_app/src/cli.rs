use std::path::PathBuf;

use clap::Args;

use crate::StageOptions;

/// How a stage finds the project it works on.
#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = false)]
pub struct ProjectSource {
    /// Topic (or its slug) of the most recent project to work on.
    #[arg(long)]
    pub topic: Option<String>,

    /// Path to a project's scenes file.
    #[arg(long)]
    pub input: Option<PathBuf>,
}

/// Arguments shared by every stage after script generation.
#[derive(Debug, Clone, Args)]
pub struct ProjectArgs {
    #[command(flatten)]
    pub source: ProjectSource,

    /// Directory holding the project folders.
    #[arg(long, default_value = "output")]
    pub output: PathBuf,

    /// Regenerate outputs that already exist.
    #[arg(long)]
    pub no_skip: bool,
}

impl ProjectArgs {
    pub const fn stage_options(&self) -> StageOptions {
        StageOptions {
            skip_existing: !self.no_skip,
        }
    }
}
