//! Extraction cache.
//!
//! The extractor's JSON output is kept per store key, either plain
//! (`<dir>/<key>.json`) or gzip-compressed (`<dir>/<key>.json.gz`). A cached
//! document only counts as a hit if every required feature field is present;
//! anything else is treated as absent.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::FeatureVector;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// JSON pointers to the score fields, in `FeatureVector` order.
const SCORE_POINTERS: [&str; 11] = [
    "/highlevel/danceability/all/danceable",
    "/highlevel/mood_aggressive/all/aggressive",
    "/highlevel/mood_electronic/all/electronic",
    "/highlevel/mood_acoustic/all/acoustic",
    "/highlevel/mood_happy/all/happy",
    "/highlevel/mood_party/all/party",
    "/highlevel/mood_relaxed/all/relaxed",
    "/highlevel/mood_sad/all/sad",
    "/highlevel/timbre/all/dark",
    "/highlevel/tonal_atonal/all/tonal",
    "/highlevel/voice_instrumental/all/voice",
];

const BPM_POINTER: &str = "/rhythm/bpm";

/// Pull the feature vector out of an extractor document.
/// `None` if it is not JSON or any required field is missing or non-numeric.
pub fn parse_features<R: Read>(reader: R) -> Option<FeatureVector> {
    let doc: Value = serde_json::from_reader(reader).ok()?;
    let score = |i: usize| doc.pointer(SCORE_POINTERS[i]).and_then(Value::as_f64);

    Some(FeatureVector {
        danceable: score(0)?,
        aggressive: score(1)?,
        electronic: score(2)?,
        acoustic: score(3)?,
        happy: score(4)?,
        party: score(5)?,
        relaxed: score(6)?,
        sad: score(7)?,
        dark: score(8)?,
        tonal: score(9)?,
        voice: score(10)?,
        bpm: doc.pointer(BPM_POINTER).and_then(Value::as_f64)? as i64,
    })
}

/// Parse a plain JSON file; unreadable files count as malformed.
pub fn read_features(path: &Path) -> Option<FeatureVector> {
    let file = File::open(path).ok()?;
    parse_features(BufReader::new(file))
}

/// Parse a gzip-compressed JSON file.
pub fn read_features_gz(path: &Path) -> Option<FeatureVector> {
    let file = File::open(path).ok()?;
    parse_features(BufReader::new(GzDecoder::new(file)))
}

/// Compress `plain` to `<plain>.gz` and remove the plain file.
/// On failure the partial archive is removed and the plain file kept.
pub fn compress_in_place(plain: &Path) -> Result<PathBuf, CacheError> {
    let gz = gz_path_for(plain);
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CacheError::Io { path, source }
    };

    let write = || -> Result<(), CacheError> {
        let mut input = File::open(plain).map_err(io_err(plain))?;
        let output = File::create(&gz).map_err(io_err(&gz))?;
        let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
        std::io::copy(&mut input, &mut encoder).map_err(io_err(&gz))?;
        encoder
            .finish()
            .and_then(|mut w| w.flush())
            .map_err(io_err(&gz))?;
        Ok(())
    };

    if let Err(e) = write() {
        let _ = std::fs::remove_file(&gz);
        return Err(e);
    }
    std::fs::remove_file(plain).map_err(io_err(plain))?;
    Ok(gz)
}

fn gz_path_for(plain: &Path) -> PathBuf {
    let mut name = plain.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

/// Where a fresh extraction should be written, and what happens to it after.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputTarget {
    /// Inside the persistent cache; compressed after parsing.
    Cached(PathBuf),
    /// Scratch file; deleted after parsing.
    Scratch(PathBuf),
}

impl OutputTarget {
    pub fn path(&self) -> &Path {
        match self {
            OutputTarget::Cached(p) | OutputTarget::Scratch(p) => p,
        }
    }
}

/// Two-tier (plain, gzip) cache of extractor output.
#[derive(Clone, Debug)]
pub struct ExtractionCache {
    dir: Option<PathBuf>,
}

impl ExtractionCache {
    pub fn new(dir: Option<&Path>) -> Self {
        Self {
            dir: dir.map(Path::to_path_buf),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    pub fn plain_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", key)))
    }

    pub fn gz_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json.gz", key)))
    }

    /// Cached features for `key`: plain file first, then the gzip form.
    pub fn lookup(&self, key: &str) -> Option<FeatureVector> {
        let plain = self.plain_path(key)?;
        if plain.exists() {
            if let Some(features) = read_features(&plain) {
                return Some(features);
            }
        }
        let gz = self.gz_path(key)?;
        if gz.exists() {
            return read_features_gz(&gz);
        }
        None
    }

    /// Choose (and prepare) the extractor output location for a job.
    /// A stale plain cache file is removed so a missing output is detectable.
    pub fn output_target(
        &self,
        key: &str,
        idx: usize,
        scratch: &Path,
    ) -> Result<OutputTarget, CacheError> {
        match self.plain_path(key) {
            Some(plain) => {
                if let Some(parent) = plain.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                if plain.exists() {
                    let _ = std::fs::remove_file(&plain);
                }
                Ok(OutputTarget::Cached(plain))
            }
            None => Ok(OutputTarget::Scratch(scratch.join(format!("essentia-{}.json", idx)))),
        }
    }

    /// Parse a fresh extraction and settle its file: compress cached output
    /// (best-effort), delete scratch output. Malformed output is deleted.
    pub fn absorb(&self, target: &OutputTarget) -> Option<FeatureVector> {
        let features = read_features(target.path());
        match (target, &features) {
            (OutputTarget::Cached(path), Some(_)) => {
                if let Err(e) = compress_in_place(path) {
                    tracing::debug!("Leaving {} uncompressed: {}", path.display(), e);
                }
            }
            (OutputTarget::Cached(path), None) | (OutputTarget::Scratch(path), _) => {
                let _ = std::fs::remove_file(path);
            }
        }
        features
    }
}

/// Serialize a feature vector in the extractor's nested layout.
/// Used to seed caches and by test fixtures.
pub fn features_to_json(f: &FeatureVector) -> Value {
    serde_json::json!({
        "highlevel": {
            "danceability": {"all": {"danceable": f.danceable}},
            "mood_aggressive": {"all": {"aggressive": f.aggressive}},
            "mood_electronic": {"all": {"electronic": f.electronic}},
            "mood_acoustic": {"all": {"acoustic": f.acoustic}},
            "mood_happy": {"all": {"happy": f.happy}},
            "mood_party": {"all": {"party": f.party}},
            "mood_relaxed": {"all": {"relaxed": f.relaxed}},
            "mood_sad": {"all": {"sad": f.sad}},
            "timbre": {"all": {"dark": f.dark}},
            "tonal_atonal": {"all": {"tonal": f.tonal}},
            "voice_instrumental": {"all": {"voice": f.voice}},
        },
        "rhythm": {"bpm": f.bpm as f64},
    })
}
