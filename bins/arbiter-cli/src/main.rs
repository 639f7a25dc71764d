mod commands;

use anyhow::Result;
use arbiter_common::Backend;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arbiter-cli")]
#[command(about = "Arbiter CLI - Judge solutions locally and inspect problems", long_about = None)]
struct Cli {
    /// Problems directory (defaults to PROBLEMS_DIR or ./problems)
    #[arg(long, global = true)]
    problems_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge a source file against a problem
    Run {
        /// Path to the solution file
        file: PathBuf,

        /// Problem id (directory name under the problems directory)
        #[arg(short, long)]
        problem: String,

        /// Language name (python, cpp); guessed from the extension when omitted
        #[arg(short, long)]
        language: Option<String>,

        /// Isolation backend (docker, local)
        #[arg(short, long)]
        backend: Option<Backend>,

        /// Print the final submission as JSON
        #[arg(long)]
        json: bool,
    },

    /// List problems that load cleanly
    Problems,

    /// List supported languages and their commands
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = arbiter_common::Config::from_env();
    if let Some(dir) = cli.problems_dir {
        config.problems_dir = dir;
    }

    match cli.command {
        Commands::Run {
            file,
            problem,
            language,
            backend,
            json,
        } => {
            if let Some(backend) = backend {
                config.backend = backend;
            }
            commands::run(&config, &file, &problem, language.as_deref(), json).await?;
        }
        Commands::Problems => {
            commands::list_problems(&config).await?;
        }
        Commands::Languages => {
            commands::list_languages(&config);
        }
    }

    Ok(())
}
