//! Analysis engine.
//!
//! Each job resolves its tags, then its features (cache hit, or a fresh run
//! of the external extractor), and reports a `JobOutcome`. Jobs run on a
//! bounded rayon pool; outcomes stream back to the caller over a channel in
//! completion order so the caller can write them from a single thread.

use crossbeam_channel::unbounded;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::cache::ExtractionCache;
use crate::models::{CandidateJob, FeatureVector, JobOutcome, SkipReason, TagSet, TrackRecord};
use crate::progress::PhaseProgress;
use crate::tags::TagSource;

/// Mode literal passed as the extractor's third argument.
pub const EXTRACTOR_PROFILE: &str = "profile";

/// Anything that turns an audio file into an extractor JSON document.
pub trait FeatureExtractor: Send + Sync {
    /// Run to completion. An `Err` means the process could not be run at
    /// all; a run that leaves no output is detected by the caller.
    fn extract(&self, input: &Path, output: &Path) -> std::io::Result<()>;
}

/// Spawns the extractor binary: `<binary> <input> <output> profile`.
pub struct CommandExtractor {
    binary: PathBuf,
}

impl CommandExtractor {
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
        }
    }
}

impl FeatureExtractor for CommandExtractor {
    fn extract(&self, input: &Path, output: &Path) -> std::io::Result<()> {
        let status = Command::new(&self.binary)
            .arg(input)
            .arg(output)
            .arg(EXTRACTOR_PROFILE)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            tracing::debug!("Extractor exited with {} for {}", status, input.display());
        }
        Ok(())
    }
}

/// Cooperative stop marker. Checked, never waited on.
#[derive(Clone, Debug, Default)]
pub struct StopSentinel(Option<PathBuf>);

impl StopSentinel {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self(path)
    }

    pub fn is_set(&self) -> bool {
        self.0.as_deref().map_or(false, Path::exists)
    }
}

/// What the engine does with each job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Tags and features.
    Full,
    /// Tags only, for rows the store already has.
    MetaOnly,
}

pub struct AnalysisEngine {
    extractor: Arc<dyn FeatureExtractor>,
    tags: Arc<dyn TagSource>,
    cache: ExtractionCache,
    scratch: PathBuf,
    stop: StopSentinel,
    normalize: bool,
    threads: usize,
}

impl AnalysisEngine {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        tags: Arc<dyn TagSource>,
        cache: ExtractionCache,
        scratch: &Path,
    ) -> Self {
        Self {
            extractor,
            tags,
            cache,
            scratch: scratch.to_path_buf(),
            stop: StopSentinel::default(),
            normalize: false,
            threads: crate::config::DEFAULT_THREADS,
        }
    }

    pub fn with_stop(mut self, stop: StopSentinel) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    fn skip(job: &CandidateJob, reason: SkipReason) -> JobOutcome {
        JobOutcome::Skipped {
            key: job.key.clone(),
            reason,
        }
    }

    /// CUE sub-tracks carry their resolved tags; everything else is probed.
    fn resolve_tags(&self, job: &CandidateJob) -> Option<TagSet> {
        match &job.cue {
            Some(cue) => Some(cue.tags.clone()),
            None => self.tags.read_tags(&job.path, self.normalize),
        }
    }

    /// Cached features, or a fresh extraction settled into the cache.
    fn resolve_features(
        &self,
        idx: usize,
        job: &CandidateJob,
        total: usize,
    ) -> Result<FeatureVector, SkipReason> {
        if let Some(features) = self.cache.lookup(&job.key) {
            tracing::debug!("Using cached analyze results for {}", job.key);
            return Ok(features);
        }

        if !job.path.exists() {
            return Err(SkipReason::SourceMissing);
        }

        let target = self
            .cache
            .output_target(&job.key, idx, &self.scratch)
            .map_err(|e| SkipReason::ExtractorFailed(e.to_string()))?;

        if self.stop.is_set() {
            return Err(SkipReason::Stopped);
        }

        self.extractor
            .extract(&job.path, target.path())
            .map_err(|e| SkipReason::ExtractorFailed(e.to_string()))?;

        if !target.path().exists() {
            tracing::error!("[{}/{}] Analysis of {} failed", idx, total, job.key);
            return Err(SkipReason::NoExtractorOutput);
        }

        self.cache.absorb(&target).ok_or(SkipReason::MalformedJson)
    }

    /// Full analysis of one job. Never panics on bad input; every failure
    /// becomes a skip.
    ///
    /// Features are resolved before tags, so an untagged file still lands in
    /// the cache and only the row is withheld.
    pub fn analyze_track(&self, idx: usize, job: &CandidateJob, total: usize) -> JobOutcome {
        if self.stop.is_set() {
            return Self::skip(job, SkipReason::Stopped);
        }
        tracing::info!("[{}/{}] Analyze: {}", idx, total, job.key);

        let features = match self.resolve_features(idx, job, total) {
            Ok(features) => features,
            Err(reason) => return Self::skip(job, reason),
        };

        match self.resolve_tags(job) {
            Some(tags) => JobOutcome::Analysed(TrackRecord {
                key: job.key.clone(),
                tags,
                features,
            }),
            None => Self::skip(job, SkipReason::MissingTags),
        }
    }

    /// Tags only.
    pub fn refresh_track(&self, idx: usize, job: &CandidateJob, total: usize) -> JobOutcome {
        if self.stop.is_set() {
            return Self::skip(job, SkipReason::Stopped);
        }
        tracing::info!("[{}/{}] Update: {}", idx, total, job.key);

        match self.resolve_tags(job) {
            Some(tags) => JobOutcome::Refreshed {
                key: job.key.clone(),
                tags,
            },
            None => Self::skip(job, SkipReason::MissingTags),
        }
    }

    /// Run every job on the pool and hand each outcome to `handler` on the
    /// calling thread as soon as it completes.
    pub fn run<F>(&self, jobs: &[CandidateJob], mode: RunMode, mut handler: F) -> anyhow::Result<()>
    where
        F: FnMut(JobOutcome),
    {
        let total = jobs.len();
        if total == 0 {
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("analysis-{}", i))
            .build()?;

        let phase = match mode {
            RunMode::Full => "Analysing",
            RunMode::MetaOnly => "Updating metadata",
        };
        let progress = PhaseProgress::new(phase, total as u64);
        let (tx, rx) = unbounded::<JobOutcome>();

        std::thread::scope(|s| {
            s.spawn(move || {
                pool.scope(|scope| {
                    for (i, job) in jobs.iter().enumerate() {
                        let tx = tx.clone();
                        scope.spawn(move |_| {
                            let outcome = match mode {
                                RunMode::Full => self.analyze_track(i + 1, job, total),
                                RunMode::MetaOnly => self.refresh_track(i + 1, job, total),
                            };
                            // Receiver outlives the pool scope.
                            let _ = tx.send(outcome);
                        });
                    }
                });
                drop(tx);
            });

            for outcome in rx.iter() {
                progress.tick();
                handler(outcome);
            }
        });

        progress.finish(&format!("{} jobs", total));
        Ok(())
    }
}
