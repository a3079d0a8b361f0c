//! One indexing run, end to end.
//!
//! ```text
//! staleness sweep -> discover -> resume filter -> CUE split -> analysis pool
//!                                                                  |
//!                               TrackStore (coordinator thread) <--+
//! ```

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

use crate::analysis::{AnalysisEngine, FeatureExtractor, RunMode, StopSentinel};
use crate::cache::ExtractionCache;
use crate::config::Config;
use crate::cue::{CueSplitter, CueVirtualizer, LibraryIndex};
use crate::models::{JobOutcome, RunStats};
use crate::progress::format_duration;
use crate::safety::validate_store_path;
use crate::store::TrackStore;
use crate::tags::TagSource;
use crate::walker;

#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    /// Delete rows whose source file has gone.
    pub remove_old: bool,
    /// Refresh tags of every discovered track; never extract.
    pub meta_only: bool,
}

fn open_index(config: &Config) -> Option<LibraryIndex> {
    let path = config.lmsdb.as_deref()?;
    match LibraryIndex::open(path) {
        Ok(index) => Some(index),
        Err(e) => {
            tracing::warn!("Failed to open library index {}: {}", path.display(), e);
            None
        }
    }
}

fn scratch_dir(config: &Config) -> Result<TempDir> {
    let dir = match &config.tmp {
        Some(tmp) => TempDir::new_in(tmp),
        None => TempDir::new(),
    };
    dir.context("Failed to create scratch directory")
}

pub fn run(
    config: &Config,
    options: RunOptions,
    extractor: Arc<dyn FeatureExtractor>,
    tags: Arc<dyn TagSource>,
) -> Result<RunStats> {
    let start = Instant::now();
    let mut stats = RunStats::default();
    tracing::debug!("Music path: {}", config.essentia);

    validate_store_path(&config.db, config.lmsdb.as_deref())?;
    let mut store = TrackStore::open(&config.db)
        .with_context(|| format!("Failed to open track store {}", config.db.display()))?;
    let index = open_index(config);

    let root = Path::new(&config.essentia);
    if options.remove_old && !options.meta_only {
        stats.removed_stale = match store.remove_old_tracks(root) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!("Failed to remove old tracks: {}", e);
                false
            }
        };
    }

    let scratch = scratch_dir(config)?;
    tracing::debug!("Temp folder: {}", scratch.path().display());

    let virtualizer = CueVirtualizer::new(index, &config.lms, scratch.path());
    let discovered = walker::discover(root, &virtualizer);
    let mut jobs = walker::pending_jobs(discovered, options.meta_only, &store)?;
    stats.jobs = jobs.len();
    stats.cue_jobs = jobs.iter().filter(|j| j.is_cue()).count();
    tracing::debug!("Num tracks to update: {}", jobs.len());

    if !options.meta_only && stats.cue_jobs > 0 {
        let (ready, failures) = CueSplitter::new(&config.decoder, config.threads).split_all(jobs)?;
        jobs = ready;
        stats.split_failures = failures;
    }

    let engine = AnalysisEngine::new(
        extractor,
        tags,
        ExtractionCache::new(config.json_cache.as_deref().map(Path::new)),
        scratch.path(),
    )
    .with_stop(StopSentinel::new(config.stop.clone()))
    .with_normalize(config.normalize_tags)
    .with_threads(config.threads);

    let mode = if options.meta_only {
        RunMode::MetaOnly
    } else {
        RunMode::Full
    };

    engine.run(&jobs, mode, |outcome| match outcome {
        JobOutcome::Analysed(record) => match store.add(&record) {
            Ok(()) => stats.added += 1,
            Err(e) => tracing::error!("Failed to add {}: {}", record.key, e),
        },
        JobOutcome::Refreshed { key, tags } => match store.update(&key, &tags) {
            Ok(true) => stats.refreshed += 1,
            Ok(false) => tracing::debug!("No stored row for {}", key),
            Err(e) => tracing::error!("Failed to update {}: {}", key, e),
        },
        JobOutcome::Skipped { key, reason } => {
            stats.skipped += 1;
            tracing::debug!("Skipped {} ({})", key, reason);
        }
    })?;

    store.commit().context("Failed to commit track store")?;
    stats.commits = store.commit_count();
    stats.elapsed_seconds = start.elapsed().as_secs_f64();

    tracing::info!(
        "Finished: {} added, {} refreshed, {} skipped in {}",
        stats.added,
        stats.refreshed,
        stats.skipped,
        format_duration(start.elapsed())
    );
    stats.log();
    Ok(stats)
}
