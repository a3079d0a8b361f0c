//! Core data models for library indexing.
//!
//! This module contains the records passed between discovery, analysis and
//! the track store.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Tags
// ============================================================================

/// Separator used when genres are joined into a single store column, and
/// when splitting single-frame ID3 genre values.
pub const GENRE_SEPARATOR: &str = ";";

/// Descriptive metadata for one logical track.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TagSet {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub albumartist: Option<String>,
    pub genres: Option<Vec<String>>,
    pub duration: i64, // whole seconds
}

impl TagSet {
    /// Genres joined for the `genre` column, `None` when absent.
    pub fn genre_column(&self) -> Option<String> {
        self.genres.as_ref().map(|g| g.join(GENRE_SEPARATOR))
    }
}

// ============================================================================
// Features
// ============================================================================

/// Mood/character scores plus BPM produced by the external extractor.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FeatureVector {
    pub danceable: f64,
    pub aggressive: f64,
    pub electronic: f64,
    pub acoustic: f64,
    pub happy: f64,
    pub party: f64,
    pub relaxed: f64,
    pub sad: f64,
    pub dark: f64,
    pub tonal: f64,
    pub voice: f64,
    pub bpm: i64,
}

/// Fully resolved row: written to the store only when both tags and
/// features are known.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackRecord {
    pub key: String,
    pub tags: TagSet,
    pub features: FeatureVector,
}

// ============================================================================
// Jobs
// ============================================================================

/// One logical sub-track of a physical file described by a cue sheet.
#[derive(Clone, Debug, PartialEq)]
pub struct CueDescriptor {
    pub start: f64,
    pub end: f64,
    pub tags: TagSet,
    /// Clip location under the scratch root; a pure function of
    /// (store key, start, end).
    pub virtual_path: PathBuf,
    /// The physical file the clip is cut from.
    pub source: PathBuf,
}

/// Unit of work handed to the analysis engine.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateJob {
    /// File the extractor and tag reader look at.
    pub path: PathBuf,
    /// Path relative to the library root (or its CUE-encoded form).
    pub key: String,
    pub cue: Option<CueDescriptor>,
}

impl CandidateJob {
    pub fn plain(path: PathBuf, key: String) -> Self {
        Self {
            path,
            key,
            cue: None,
        }
    }

    pub fn is_cue(&self) -> bool {
        self.cue.is_some()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Reason a job produced no record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The stop sentinel was present.
    Stopped,
    /// The extractor ran but left no output file.
    NoExtractorOutput,
    /// The extractor could not be spawned.
    ExtractorFailed(String),
    /// Output existed but lacked required fields or was not JSON.
    MalformedJson,
    /// No tag probe could read the file.
    MissingTags,
    /// The job's input file is gone (e.g. a CUE clip that failed to split).
    SourceMissing,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Stopped => write!(f, "stopped"),
            SkipReason::NoExtractorOutput => write!(f, "no_extractor_output"),
            SkipReason::ExtractorFailed(e) => write!(f, "extractor_failed: {}", e),
            SkipReason::MalformedJson => write!(f, "malformed_json"),
            SkipReason::MissingTags => write!(f, "missing_tags"),
            SkipReason::SourceMissing => write!(f, "source_missing"),
        }
    }
}

/// Result of one worker job, handed back to the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    /// Full analysis: tags and features.
    Analysed(TrackRecord),
    /// Metadata-only refresh.
    Refreshed { key: String, tags: TagSet },
    Skipped { key: String, reason: SkipReason },
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one run, logged at the end.
#[derive(Default, Debug, Clone, Serialize)]
pub struct RunStats {
    pub jobs: usize,
    pub cue_jobs: usize,
    pub split_failures: usize,
    pub added: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub removed_stale: bool,
    pub commits: usize,
    pub elapsed_seconds: f64,
}

impl RunStats {
    /// Log stats as pretty JSON at debug level.
    pub fn log(&self) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            tracing::debug!("Run stats:\n{}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genre_column_joins_with_separator() {
        let tags = TagSet {
            genres: Some(vec!["Rock".to_string(), "Pop".to_string()]),
            ..Default::default()
        };
        assert_eq!(tags.genre_column(), Some("Rock;Pop".to_string()));
        assert_eq!(TagSet::default().genre_column(), None);
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(SkipReason::MissingTags.to_string(), "missing_tags");
        assert_eq!(
            SkipReason::ExtractorFailed("not found".to_string()).to_string(),
            "extractor_failed: not found"
        );
    }
}
