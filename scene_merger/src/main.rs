use std::process::ExitCode;

use clap::Parser;
use sr_app::Stage;
use sr_app::cli::ProjectArgs;

/// Loop each scene's clip to the length of its narration and mux them.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    project: ProjectArgs,

    /// x264 preset for the per-scene encode.
    #[arg(long)]
    preset: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match sr_app::initialize::<scene_merger::Config>() {
        Ok(config) => config,
        Err(err) => return sr_app::exit_code(Stage::Merge, Err(err)),
    };
    if let Some(preset) = cli.preset {
        config.profile.preset = preset;
    }

    let result = scene_merger::run(&cli.project, &config).await;
    sr_app::exit_code(Stage::Merge, result)
}
