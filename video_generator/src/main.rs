use std::process::ExitCode;

use clap::Parser;
use sr_app::Stage;
use sr_app::cli::ProjectArgs;

/// Animate each scene's first image into a short silent clip.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    project: ProjectArgs,

    /// Frame rate of the generated clips.
    #[arg(long)]
    fps: Option<u32>,

    /// Amount of motion, 1 to 255.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..))]
    motion: Option<u8>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match sr_app::initialize::<video_generator::Config>() {
        Ok(config) => config,
        Err(err) => return sr_app::exit_code(Stage::Video, Err(err)),
    };
    if let Some(fps) = cli.fps {
        config.fps = fps;
    }
    if let Some(motion) = cli.motion {
        config.motion_bucket = motion;
    }

    let result = video_generator::run(&cli.project, &config).await;
    sr_app::exit_code(Stage::Video, result)
}
