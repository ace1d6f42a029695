use std::process::ExitCode;

use clap::Parser;
use sr_app::Stage;
use sr_app::cli::ProjectArgs;

/// Synthesize the narration of every scene in a project.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    project: ProjectArgs,

    /// Voice used for every scene.
    #[arg(long)]
    voice: Option<String>,

    /// Pause between synthesis calls, in milliseconds.
    #[arg(long)]
    rate_limit_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match sr_app::initialize::<audio_generator::Config>() {
        Ok(config) => config,
        Err(err) => return sr_app::exit_code(Stage::Audio, Err(err)),
    };

    if let Some(voice) = cli.voice {
        config.voice = voice;
    }
    if let Some(rate_limit_ms) = cli.rate_limit_ms {
        config.rate_limit_ms = rate_limit_ms;
    }

    let result = audio_generator::run(&cli.project, &config).await;
    sr_app::exit_code(Stage::Audio, result)
}
