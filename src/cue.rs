//! CUE sheet virtualization.
//!
//! A physical file with a sibling `.cue` sheet is expanded into one job per
//! logical track, using the companion library index (read-only) for track
//! boundaries and metadata. Each logical track is then cut into its own clip
//! under the scratch root so the extractor can treat it as a normal file.
//!
//! ## Store keys
//!
//! A sub-track's store key is the physical file's key followed by a marker
//! and the offsets, e.g. `Artist/Album/album.flac.CUE_TRACK.0-245.3.mp3`.
//! The offsets are copied verbatim from the index URL fragment, so
//! `#0-245.30` yields `0-245.30` in the key. `encode_cue_key` and
//! `decode_cue_key` are the only places this format is produced or parsed.

use rayon::prelude::*;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

use crate::models::{CandidateJob, CueDescriptor, TagSet};
use crate::progress::PhaseProgress;

/// Marker between the physical file key and the offsets.
pub const CUE_TRACK: &str = ".CUE_TRACK.";

/// Clip bitrate passed to the decoder.
const SPLIT_BITRATE: &str = "128k";

/// Contributor role codes in the library index.
const ROLE_ARTIST: i64 = 1;
const ROLE_TRACK_ARTIST: i64 = 6;
const ROLE_ALBUM_ARTIST: i64 = 5;

#[derive(Debug, Error)]
pub enum CueError {
    #[error("Library index query failed: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decoder exited with {0}")]
    Decoder(std::process::ExitStatus),

    #[error("Decoder produced no output at {0}")]
    NoOutput(PathBuf),
}

// ============================================================================
// Key codec
// ============================================================================

/// Decoded form of a CUE sub-track store key.
#[derive(Clone, Debug, PartialEq)]
pub struct CueKey {
    pub source: String,
    pub start: f64,
    pub end: f64,
}

/// Build the store key for a sub-track of `source_key`. `range` is the
/// `start-end` text of the index URL fragment.
pub fn encode_cue_key(source_key: &str, range: &str) -> String {
    format!("{}{}{}.mp3", source_key, CUE_TRACK, range)
}

/// Inverse of `encode_cue_key`; `None` for plain keys.
pub fn decode_cue_key(key: &str) -> Option<CueKey> {
    let (source, rest) = key.split_once(CUE_TRACK)?;
    let range = rest.strip_suffix(".mp3")?;
    let (start, end) = range.split_once('-')?;
    Some(CueKey {
        source: source.to_string(),
        start: start.parse().ok()?,
        end: end.parse().ok()?,
    })
}

/// Key of the physical file behind a store key (identity for plain keys).
pub fn source_key(key: &str) -> &str {
    match key.find(CUE_TRACK) {
        Some(pos) if pos > 0 => &key[..pos],
        _ => key,
    }
}

/// Offsets of a sub-track inside its physical file.
#[derive(Clone, Debug, PartialEq)]
pub struct CueRange {
    pub start: f64,
    pub end: f64,
    /// The fragment text the offsets were parsed from.
    pub text: String,
}

/// Parse the `#start-end` fragment of an index URL.
pub fn parse_fragment(url: &str) -> Option<CueRange> {
    let parts: Vec<&str> = url.split('#').collect();
    if parts.len() != 2 {
        return None;
    }
    let times: Vec<&str> = parts[1].split('-').collect();
    if times.len() != 2 {
        return None;
    }
    Some(CueRange {
        start: times[0].parse().ok()?,
        end: times[1].parse().ok()?,
        text: parts[1].to_string(),
    })
}

/// Percent-encode a filesystem path the way the index stores it in URLs
/// (separators kept).
pub fn encode_index_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Track artist from roles 1/6 (first wins), album artist from role 5.
/// If only one resolves, the other mirrors it.
pub fn resolve_artists(contributors: &[(i64, Option<String>)]) -> (Option<String>, Option<String>) {
    let mut track_artist: Option<String> = None;
    let mut album_artist: Option<String> = None;

    for (role, name) in contributors {
        if track_artist.is_none() && (*role == ROLE_ARTIST || *role == ROLE_TRACK_ARTIST) {
            track_artist = name.clone();
        } else if album_artist.is_none() && *role == ROLE_ALBUM_ARTIST {
            album_artist = name.clone();
        }
    }

    match (track_artist, album_artist) {
        (Some(t), None) => (Some(t.clone()), Some(t)),
        (None, Some(a)) => (Some(a.clone()), Some(a)),
        pair => pair,
    }
}

// ============================================================================
// Library index
// ============================================================================

/// A logical track as described by the library index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexTrack {
    pub range: CueRange,
    pub tags: TagSet,
}

/// Read-only view of the companion library database.
pub struct LibraryIndex {
    conn: Connection,
}

impl LibraryIndex {
    pub fn open(path: &Path) -> Result<Self, CueError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Tracks whose URL points into `index_path` with a `#start-end` fragment.
    /// Rows lacking an artist or an album are dropped.
    pub fn cue_tracks(&self, index_path: &str) -> Result<Vec<IndexTrack>, CueError> {
        let needle = format!("{}#", encode_index_path(index_path));
        let mut stmt = self.conn.prepare_cached(
            "SELECT url, title, id, album, secs FROM tracks WHERE instr(url, ?1) > 0",
        )?;
        let rows: Vec<(String, Option<String>, i64, Option<i64>, Option<f64>)> = stmt
            .query_map(params![needle], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut tracks = Vec::new();
        for (url, title, id, album_id, secs) in rows {
            let Some(range) = parse_fragment(&url) else {
                continue;
            };

            let (artist, albumartist) = resolve_artists(&self.contributors(id)?);
            let album = match album_id {
                Some(album_id) => self.album_title(album_id)?,
                None => None,
            };
            let (Some(artist), Some(album)) = (artist, album) else {
                continue;
            };

            let genres = self.genres(id)?;
            tracks.push(IndexTrack {
                range,
                tags: TagSet {
                    title,
                    artist: Some(artist),
                    album: Some(album),
                    albumartist,
                    genres: if genres.is_empty() { None } else { Some(genres) },
                    duration: secs.unwrap_or(0.0) as i64,
                },
            });
        }
        Ok(tracks)
    }

    fn contributors(&self, track: i64) -> Result<Vec<(i64, Option<String>)>, CueError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT ct.role, c.name FROM contributor_track ct
             LEFT JOIN contributors c ON c.id = ct.contributor
             WHERE ct.track = ?1",
        )?;
        let rows = stmt
            .query_map(params![track], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn genres(&self, track: i64) -> Result<Vec<String>, CueError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT g.name FROM genre_track gt
             JOIN genres g ON g.id = gt.genre
             WHERE gt.track = ?1",
        )?;
        let rows = stmt
            .query_map(params![track], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn album_title(&self, album: i64) -> Result<Option<String>, CueError> {
        let title = self
            .conn
            .query_row("SELECT title FROM albums WHERE id = ?1", params![album], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()?;
        Ok(title.flatten())
    }
}

// ============================================================================
// Virtualizer
// ============================================================================

pub struct CueVirtualizer {
    index: Option<LibraryIndex>,
    /// Library path prefix as the index knows it (ends with `/`).
    lms_root: String,
    scratch_root: PathBuf,
}

impl CueVirtualizer {
    pub fn new(index: Option<LibraryIndex>, lms_root: &str, scratch_root: &Path) -> Self {
        Self {
            index,
            lms_root: lms_root.to_string(),
            scratch_root: scratch_root.to_path_buf(),
        }
    }

    /// Expand a physical file into one job per logical track.
    /// Without an index, or on index errors, nothing is emitted.
    pub fn expand(&self, source: &Path, key: &str) -> Vec<CandidateJob> {
        let Some(index) = &self.index else {
            tracing::debug!("Can't get CUE tracks for {} - no LMS DB", source.display());
            return Vec::new();
        };

        tracing::debug!("Reading CUE metadata for {}", key);
        let index_path = format!("{}{}", self.lms_root, key);
        let tracks = match index.cue_tracks(&index_path) {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::warn!("Failed to read CUE tracks for {}: {}", key, e);
                return Vec::new();
            }
        };

        tracks
            .into_iter()
            .map(|track| {
                let cue_key = encode_cue_key(key, &track.range.text);
                let virtual_path = self.scratch_root.join(&cue_key);
                CandidateJob {
                    path: virtual_path.clone(),
                    key: cue_key,
                    cue: Some(CueDescriptor {
                        start: track.range.start,
                        end: track.range.end,
                        tags: track.tags,
                        virtual_path,
                        source: source.to_path_buf(),
                    }),
                }
            })
            .collect()
    }
}

// ============================================================================
// Splitting
// ============================================================================

/// Cuts CUE sub-tracks out of their physical files with an external decoder.
pub struct CueSplitter {
    decoder: String,
    threads: usize,
}

impl CueSplitter {
    pub fn new(decoder: &str, threads: usize) -> Self {
        Self {
            decoder: decoder.to_string(),
            threads: threads.max(1),
        }
    }

    fn split_one(&self, cue: &CueDescriptor) -> Result<(), CueError> {
        if let Some(dir) = cue.virtual_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        tracing::debug!("Create {}", cue.virtual_path.display());
        let status = Command::new(&self.decoder)
            .arg("-hide_banner")
            .args(["-loglevel", "panic"])
            .arg("-i")
            .arg(&cue.source)
            .args(["-b:a", SPLIT_BITRATE])
            .arg("-ss")
            .arg(cue.start.to_string())
            .arg("-t")
            .arg(format!("{:.6}", cue.end - cue.start))
            .arg(&cue.virtual_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        if !status.success() {
            return Err(CueError::Decoder(status));
        }
        if !cue.virtual_path.exists() {
            return Err(CueError::NoOutput(cue.virtual_path.clone()));
        }
        Ok(())
    }

    /// Split every CUE job; plain jobs pass through untouched.
    /// Returns the jobs that can proceed to analysis and the number of
    /// sub-tracks that failed to split.
    pub fn split_all(&self, jobs: Vec<CandidateJob>) -> anyhow::Result<(Vec<CandidateJob>, usize)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("cue-split-{}", i))
            .build()?;

        let cue_count = jobs.iter().filter(|j| j.is_cue()).count();
        let progress = PhaseProgress::new("Splitting CUE tracks", cue_count as u64);

        let results: Vec<(CandidateJob, bool)> = pool.install(|| {
            jobs.into_par_iter()
                .map(|job| {
                    let Some(cue) = &job.cue else {
                        return (job, true);
                    };
                    let ok = match self.split_one(cue) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!("Failed to split {}: {}", job.key, e);
                            false
                        }
                    };
                    progress.tick();
                    (job, ok)
                })
                .collect()
        });

        let failures = results.iter().filter(|(_, ok)| !ok).count();
        progress.finish(&format!("{} failed", failures));
        let ready = results.into_iter().filter(|(_, ok)| *ok).map(|(job, _)| job).collect();
        Ok((ready, failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cue_key_round_trip() {
        for (range, start, end) in [("0-245.3", 0.0, 245.3), ("245.3-512", 245.3, 512.0)] {
            let key = encode_cue_key("Artist/Album/album.flac", range);
            let decoded = decode_cue_key(&key).unwrap();
            assert_eq!(decoded.source, "Artist/Album/album.flac");
            assert_eq!(decoded.start, start);
            assert_eq!(decoded.end, end);
        }
    }

    #[test]
    fn test_encode_format() {
        assert_eq!(
            encode_cue_key("a/album.flac", "0-245.3"),
            "a/album.flac.CUE_TRACK.0-245.3.mp3"
        );
    }

    #[test]
    fn test_key_keeps_fragment_text() {
        for (url, range) in [("a.flac#0-245.30", "0-245.30"), ("a.flac#12-1e2", "12-1e2")] {
            let parsed = parse_fragment(url).unwrap();
            assert_eq!(parsed.text, range);
            let key = encode_cue_key("a.flac", &parsed.text);
            assert_eq!(key, format!("a.flac.CUE_TRACK.{}.mp3", range));
            let decoded = decode_cue_key(&key).unwrap();
            assert_eq!((decoded.start, decoded.end), (parsed.start, parsed.end));
        }
    }

    #[test]
    fn test_distinct_offsets_give_distinct_keys() {
        let a = encode_cue_key("album.flac", "0-10");
        let b = encode_cue_key("album.flac", "10-20");
        let c = encode_cue_key("other.flac", "0-10");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_decode_plain_key() {
        assert_eq!(decode_cue_key("a/b.mp3"), None);
        assert_eq!(source_key("a/b.mp3"), "a/b.mp3");
        assert_eq!(source_key("a/b.flac.CUE_TRACK.1-2.mp3"), "a/b.flac");
    }

    #[test]
    fn test_parse_fragment() {
        let range = parse_fragment("file:///m/a.flac#0-245.3").unwrap();
        assert_eq!((range.start, range.end), (0.0, 245.3));
        assert_eq!(parse_fragment("file:///m/a.flac"), None);
        assert_eq!(parse_fragment("file:///m/a.flac#12"), None);
        assert_eq!(parse_fragment("file:///m/a.flac#x-1"), None);
    }

    #[test]
    fn test_encode_index_path() {
        assert_eq!(
            encode_index_path("/music/AC DC/Back in Black.flac"),
            "/music/AC%20DC/Back%20in%20Black.flac"
        );
    }

    #[test]
    fn test_resolve_artists() {
        let name = |s: &str| Some(s.to_string());

        let contributors = [(1, name("Singer")), (5, name("Band")), (6, name("Other"))];
        let (track, album) = resolve_artists(&contributors);
        assert_eq!(track, name("Singer"));
        assert_eq!(album, name("Band"));

        let (track, album) = resolve_artists(&[(5, name("Band"))]);
        assert_eq!(track, name("Band"));
        assert_eq!(album, name("Band"));

        let (track, album) = resolve_artists(&[(6, name("Singer"))]);
        assert_eq!(track, name("Singer"));
        assert_eq!(album, name("Singer"));

        assert_eq!(resolve_artists(&[(2, name("Composer"))]), (None, None));
    }

    #[test]
    fn test_expand_without_index() {
        let virtualizer = CueVirtualizer::new(None, "/lms/", Path::new("/tmp/scratch"));
        assert!(virtualizer.expand(Path::new("/m/a.flac"), "a.flac").is_empty());
    }

    #[test]
    fn test_split_failure_is_isolated() {
        let dir = tempfile::TempDir::new().unwrap();
        let virtual_path = dir.path().join("x/album.flac.CUE_TRACK.0-1.mp3");
        let cue_job = CandidateJob {
            path: virtual_path.clone(),
            key: "x/album.flac.CUE_TRACK.0-1.mp3".to_string(),
            cue: Some(CueDescriptor {
                start: 0.0,
                end: 1.0,
                tags: TagSet::default(),
                virtual_path,
                source: dir.path().join("album.flac"),
            }),
        };
        let plain = CandidateJob::plain(dir.path().join("b.mp3"), "b.mp3".to_string());

        let splitter = CueSplitter::new("/nonexistent/decoder", 2);
        let (ready, failures) = splitter.split_all(vec![cue_job, plain.clone()]).unwrap();
        assert_eq!(failures, 1);
        assert_eq!(ready, vec![plain]);
    }

    #[test]
    fn test_unwritable_clip_dir_is_a_split_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        // A regular file where the clip directory should go.
        std::fs::write(dir.path().join("blocked"), b"").unwrap();
        let cue_job = |name: &str| {
            let key = format!("{}/album.flac.CUE_TRACK.0-1.mp3", name);
            let virtual_path = dir.path().join(&key);
            CandidateJob {
                path: virtual_path.clone(),
                key,
                cue: Some(CueDescriptor {
                    start: 0.0,
                    end: 1.0,
                    tags: TagSet::default(),
                    virtual_path,
                    source: dir.path().join("album.flac"),
                }),
            }
        };
        let plain = CandidateJob::plain(dir.path().join("b.mp3"), "b.mp3".to_string());

        let splitter = CueSplitter::new("/nonexistent/decoder", 2);
        let jobs = vec![cue_job("blocked"), cue_job("open"), plain.clone()];
        let (ready, failures) = splitter.split_all(jobs).unwrap();
        assert_eq!(failures, 2);
        assert_eq!(ready, vec![plain]);
        assert!(dir.path().join("open").is_dir());
    }
}
