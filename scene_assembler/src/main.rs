use std::process::ExitCode;

use clap::Parser;
use sr_app::Stage;
use sr_app::cli::ProjectArgs;

/// Concatenate every final scene clip into the finished video.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    project: ProjectArgs,

    /// Output frame rate.
    #[arg(long)]
    fps: Option<f64>,

    /// Length of the fade at each end, in seconds.
    #[arg(long)]
    fade: Option<f64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match sr_app::initialize::<scene_assembler::Config>() {
        Ok(config) => config,
        Err(err) => return sr_app::exit_code(Stage::Assemble, Err(err)),
    };
    if let Some(fps) = cli.fps {
        config.frame_rate = fps;
    }
    if let Some(fade) = cli.fade {
        config.fade_secs = fade;
    }

    let result = scene_assembler::run(&cli.project, &config).await;
    sr_app::exit_code(Stage::Assemble, result)
}
