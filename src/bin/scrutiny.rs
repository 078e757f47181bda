//! The launcher: validates arguments, sets up tracing and drives the engine
//! on a current-thread runtime until interrupted.

use clap::Parser;
use scrutiny::{default_worker_count, Compression, Engine, EngineConfig};
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scrutiny", version, about = "Always-on codebase monitor")]
struct Args {
    /// The project directory to monitor.
    directory: PathBuf,

    /// Number of worker processes; defaults to the cpu count minus one.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Command used to start an editor, e.g. "vi +{line}".
    #[arg(short, long)]
    editor: Option<String>,

    /// Syntax highlighting theme name.
    #[arg(short, long)]
    theme: Option<String>,

    /// Compression used for cached reports.
    #[arg(short, long, default_value_t = Compression::Gzip)]
    compression: Compression,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Some(0) = args.workers {
        eprintln!("there must be at least one worker");
        return ExitCode::FAILURE;
    }

    let mut config = EngineConfig::new(args.directory);
    config.worker_count = args.workers.unwrap_or_else(default_worker_count);
    config.compression = args.compression;
    config.theme = args.theme;
    config.editor_command = args
        .editor
        .or_else(|| std::env::var("EDITOR").ok())
        .or_else(|| std::env::var("VISUAL").ok());

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime");
    let local = tokio::task::LocalSet::new();
    match local.block_on(&runtime, engine.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
