mod client;
mod config;
mod context;
mod init;
mod logger;
mod orchestrator;
mod parser;
mod sandbox;
mod summary;
mod task;
mod testrun;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::{ConfigFile, RunConfig};
use logger::Logger;
use orchestrator::RunEnd;

#[derive(Parser, Debug)]
#[command(
    name = "redgreen",
    about = "Autonomous TDD orchestrator for local LLMs -- loops until the tests pass",
    long_about = None,
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Project directory containing the steering files and workspace/
    #[arg(long, env = "REDGREEN_PROJECT", default_value = ".")]
    project: PathBuf,

    /// Task file, relative to the project directory
    #[arg(long)]
    task: Option<String>,

    /// Philosophy file, relative to the project directory
    #[arg(long)]
    philosophy: Option<String>,

    /// Override the workspace directory
    #[arg(long)]
    workspace: Option<String>,

    /// Override the model endpoint URL
    #[arg(long, env = "REDGREEN_URL")]
    url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scaffold a project directory with template steering files
    Init {
        /// Directory to create (must not already exist)
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // ── init subcommand ───────────────────────────────────────────────────────
    if let Some(Command::Init { dir }) = args.command {
        match init::scaffold(&dir) {
            Ok(()) => {
                println!("Scaffolded {}", dir.display());
                println!("Edit philosophy.md and task.md, then run:");
                println!("  redgreen --project {}", dir.display());
            }
            Err(e) => {
                eprintln!("init failed: {e:#}");
                std::process::exit(1);
            }
        }
        return;
    }

    // ── run ───────────────────────────────────────────────────────────────────
    let file = match ConfigFile::load(&args.project) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            std::process::exit(1);
        }
    };
    let config = RunConfig::resolve(
        &file,
        &args.project,
        args.task.as_deref(),
        args.philosophy.as_deref(),
        args.workspace.as_deref(),
        args.url.as_deref(),
    );

    let logger = match Logger::open(&config.project_dir) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            std::process::exit(1);
        }
    };

    match orchestrator::run(&config, &logger).await {
        Ok(RunEnd::Success) => {}
        Ok(RunEnd::Halted(_)) => {
            // reason already logged, three bells already rung
            std::process::exit(1);
        }
        Err(e) => {
            logger.log(&format!("FATAL: {e:#}"));
            logger.bell();
            std::process::exit(1);
        }
    }
}
