use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use essentia_index::normalize::{normalize_album_str, normalize_artist_bulk};
use essentia_index::progress::init_logging;
use essentia_index::store::{TagColumn, TrackStore};

#[derive(Parser)]
#[command(name = "update-db")]
#[command(about = "Maintenance for the Essentia track store")]
struct Args {
    /// Database file
    #[arg(short, long, default_value = "essentia.db")]
    db: PathBuf,

    /// File listing path prefixes to flag as ignored, one per line
    #[arg(short, long)]
    ignore: Option<PathBuf>,

    /// Normalize artist, albumartist, and album
    #[arg(short, long)]
    normalize: bool,
}

fn read_ignore_list(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

fn normalize(store: &mut TrackStore) -> Result<()> {
    for column in [TagColumn::Artist, TagColumn::AlbumArtist, TagColumn::Album] {
        tracing::info!("Normalizing: {}", column.as_str());
        let changed = match column {
            TagColumn::Album => store.rewrite_column(column, normalize_album_str)?,
            _ => store.rewrite_column(column, normalize_artist_bulk)?,
        };
        tracing::info!("  {} distinct values changed", changed);
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging("info");
    let args = Args::parse();

    if !args.normalize && args.ignore.is_none() {
        tracing::info!("Nothing to do");
        return Ok(());
    }
    if !args.db.exists() {
        bail!("{} does not exist", args.db.display());
    }

    let mut store = TrackStore::open(&args.db)
        .with_context(|| format!("Failed to open {}", args.db.display()))?;

    if let Some(ignore) = &args.ignore {
        let prefixes = read_ignore_list(ignore)?;
        let flagged = store.apply_ignore_list(&prefixes)?;
        tracing::info!("Flagged {} tracks as ignored", flagged);
    }

    if args.normalize {
        normalize(&mut store)?;
    }

    Ok(())
}
