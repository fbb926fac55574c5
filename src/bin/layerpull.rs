use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use layerpull::{load_config, PullConfig, Puller};

#[derive(Parser, Debug)]
#[command(name = "layerpull", version, about = "Pull a layered image onto a directory")]
struct Cli {
    /// Config file (YAML or JSON)
    #[arg(long, global = true, env = "LAYERPULL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download an image and apply its layers to DEST
    Pull {
        /// Image reference, e.g. `busybox:latest` or `localhost:5000/team/tool:v1`
        image: String,
        /// Destination directory (created if missing)
        dest: PathBuf,
        /// Commit every layer on its own git branch
        #[arg(long)]
        layered: bool,
        /// Maximum simultaneous layer downloads
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,
        /// Per-layer download deadline, e.g. `90s`
        #[arg(long, value_parser = humantime::parse_duration)]
        job_timeout: Option<Duration>,
        /// Index host for names that don't carry one
        #[arg(long)]
        index: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => PullConfig::default(),
    };

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Pull {
            image,
            dest,
            layered,
            concurrency,
            job_timeout,
            index,
        } => {
            if let Some(k) = concurrency {
                config = config.concurrency(k);
            }
            if let Some(t) = job_timeout {
                config = config.job_timeout(t);
            }
            if let Some(index) = index {
                config = config.index(index);
            }

            let puller = Puller::new(config)?;
            let report = if layered {
                puller.pull_repository(&image, &dest).await?
            } else {
                puller.pull_image(&image, &dest).await?
            };

            println!("image: {}:{}", report.image.repository, report.image.tag);
            println!("id: {}", report.leaf);
            for (position, layer) in report.layers.iter().enumerate() {
                println!("  {:>3}  {}", position, layer);
            }
            println!("bytes: {}", report.bytes);
            println!("dest: {}", report.destination.display());
        }
    }
    Ok(())
}
