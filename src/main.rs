use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use essentia_index::analysis::CommandExtractor;
use essentia_index::config::Config;
use essentia_index::indexer::{self, RunOptions};
use essentia_index::progress::{init_logging, set_log_only};
use essentia_index::tags::TagReader;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser)]
#[command(name = "essentia-analyzer")]
#[command(about = "Analyse a music library with Essentia and index the results in SQLite")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Update metadata database only
    #[arg(short, long)]
    meta_only: bool,

    /// Do not remove non-existent tracks from DB
    #[arg(short, long)]
    keep_old: bool,

    /// Hide progress bars, log periodic progress lines instead
    #[arg(long)]
    log_only: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_filter());
    set_log_only(args.log_only);

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let options = RunOptions {
        remove_old: !args.keep_old,
        meta_only: args.meta_only,
    };
    let extractor = Arc::new(CommandExtractor::new(&config.extractor));
    let tags = Arc::new(TagReader::new());

    indexer::run(&config, options, extractor, tags)?;
    tracing::debug!("Finished analysis");
    Ok(())
}
