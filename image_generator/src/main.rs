use std::process::ExitCode;

use clap::Parser;
use sr_app::Stage;
use sr_app::cli::ProjectArgs;

/// Render keyframe images for every scene in a project.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    project: ProjectArgs,

    /// Images per scene.
    #[arg(long)]
    variations: Option<u32>,

    /// Base seed for reproducible images.
    #[arg(long)]
    seed: Option<u64>,

    /// Diffusion steps per image.
    #[arg(long)]
    steps: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match sr_app::initialize::<image_generator::Config>() {
        Ok(config) => config,
        Err(err) => return sr_app::exit_code(Stage::Image, Err(err)),
    };
    if let Some(variations) = cli.variations {
        config.variations = variations;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(steps) = cli.steps {
        config.steps = steps;
    }

    let result = image_generator::run(&cli.project, &config).await;
    sr_app::exit_code(Stage::Image, result)
}
