use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser};
use script_generator::{FallbackPolicy, parse_topics, run_batch, run_topic};
use sr_app::{Stage, StageError, StageOptions};

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct TopicSource {
    /// Topic of the video, in plain words.
    #[arg(long)]
    topic: Option<String>,

    /// File with one topic per line; each becomes its own project.
    #[arg(long)]
    topics_file: Option<PathBuf>,
}

/// Write the storyboard for a new video project.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    source: TopicSource,

    /// Directory the project folder is created in.
    #[arg(long, default_value = "output")]
    output: PathBuf,

    /// Narrate the scenes right after writing them.
    #[arg(long)]
    with_audio: bool,

    /// Write a new project even if this topic already has one.
    #[arg(long)]
    no_skip: bool,

    /// Maximum number of scenes to keep.
    #[arg(long)]
    scenes: Option<usize>,

    /// What to do when the model never returns a usable storyboard.
    #[arg(long, value_enum)]
    fallback: Option<FallbackPolicy>,

    /// Text model to ask.
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match sr_app::initialize::<script_generator::Config>() {
        Ok(config) => config,
        Err(err) => return sr_app::exit_code(Stage::Script, Err(err)),
    };
    if let Some(scenes) = cli.scenes {
        config.max_scenes = scenes;
    }
    if let Some(fallback) = cli.fallback {
        config.fallback = fallback;
    }
    if let Some(model) = cli.model {
        config.llm.model = model;
    }

    let options = StageOptions {
        skip_existing: !cli.no_skip,
    };

    let audio = if cli.with_audio {
        match sr_app::config::load::<audio_generator::Config>() {
            Ok(audio) => Some(audio),
            Err(err) => return sr_app::exit_code(Stage::Audio, Err(err)),
        }
    } else {
        None
    };

    if let Some(topics_file) = cli.source.topics_file {
        let topics = match tokio::fs::read_to_string(&topics_file).await {
            Ok(contents) => parse_topics(&contents),
            Err(source) => {
                return sr_app::exit_code(
                    Stage::Script,
                    Err(StageError::Io {
                        path: topics_file,
                        source,
                    }),
                );
            }
        };

        let summary = run_batch(&topics, &cli.output, &config, audio.as_ref(), options).await;
        println!("{summary}");
        return ExitCode::SUCCESS;
    }

    let Some(topic) = cli.source.topic else {
        return ExitCode::FAILURE;
    };
    let now = chrono::Local::now().naive_local();

    match run_topic(&topic, &cli.output, &config, audio.as_ref(), options, now).await {
        Ok(run) => {
            println!("project: {}", run.manifest.root().display());
            let script = sr_app::exit_code(Stage::Script, Ok(run.script));
            match run.audio {
                Some(audio) => sr_app::exit_code(Stage::Audio, Ok(audio)),
                None => script,
            }
        }
        Err(err) => sr_app::exit_code(Stage::Script, Err(err)),
    }
}
