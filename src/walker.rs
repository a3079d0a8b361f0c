//! Library discovery.
//!
//! Walks the library root in file-name order and turns every supported audio
//! file into one or more candidate jobs. Filtering against the store is a
//! separate step so discovery stays free of side effects.

use std::path::Path;
use walkdir::WalkDir;

use crate::cue::CueVirtualizer;
use crate::models::CandidateJob;
use crate::store::{StoreError, TrackStore};

/// Extensions considered audio (compared case-insensitively).
pub const AUDIO_EXTENSIONS: [&str; 4] = ["m4a", "mp3", "ogg", "flac"];

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Store key for `path`: its location relative to the library root.
pub fn store_key(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.to_str())
        .map(String::from)
}

/// Discover every candidate job under `root`.
///
/// A file with a sibling `<stem>.cue` is handed to the virtualizer and
/// contributes zero or more sub-track jobs; any other audio file contributes
/// one plain job.
pub fn discover(root: &Path, virtualizer: &CueVirtualizer) -> Vec<CandidateJob> {
    if !root.exists() {
        tracing::error!("'{}' does not exist", root.display());
        return Vec::new();
    }

    let mut jobs = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Error accessing entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !is_audio_file(path) {
            continue;
        }
        let Some(key) = store_key(root, path) else {
            tracing::warn!("Skipping non UTF-8 path {}", path.display());
            continue;
        };

        if path.with_extension("cue").exists() {
            jobs.extend(virtualizer.expand(path, &key));
        } else {
            jobs.push(CandidateJob::plain(path.to_path_buf(), key));
        }
    }

    tracing::debug!("Discovered {} candidate jobs under {}", jobs.len(), root.display());
    jobs
}

/// Keep the jobs that still need work. Metadata refresh revisits everything;
/// a full run skips keys the store already has features for.
pub fn pending_jobs(
    jobs: Vec<CandidateJob>,
    meta_only: bool,
    store: &TrackStore,
) -> Result<Vec<CandidateJob>, StoreError> {
    if meta_only {
        return Ok(jobs);
    }
    let mut pending = Vec::with_capacity(jobs.len());
    for job in jobs {
        if !store.file_already_analysed(&job.key)? {
            pending.push(job);
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureVector, TagSet, TrackRecord};
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn no_index(scratch: &Path) -> CueVirtualizer {
        CueVirtualizer::new(None, "/lms/", scratch)
    }

    #[test]
    fn test_is_audio_file() {
        assert!(is_audio_file(Path::new("a/b.mp3")));
        assert!(is_audio_file(Path::new("a/b.FLAC")));
        assert!(is_audio_file(Path::new("b.m4a")));
        assert!(!is_audio_file(Path::new("b.wav")));
        assert!(!is_audio_file(Path::new("b.cue")));
        assert!(!is_audio_file(Path::new("mp3")));
    }

    #[test]
    fn test_discover_order_and_keys() {
        let root = TempDir::new().unwrap();
        touch(root.path(), "b/2.mp3");
        touch(root.path(), "a/1.ogg");
        touch(root.path(), "a/cover.jpg");
        touch(root.path(), "c.m4a");

        let scratch = TempDir::new().unwrap();
        let jobs = discover(root.path(), &no_index(scratch.path()));
        let keys: Vec<&str> = jobs.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1.ogg", "b/2.mp3", "c.m4a"]);
        assert!(jobs.iter().all(|j| !j.is_cue()));
        assert_eq!(jobs[0].path, root.path().join("a/1.ogg"));
    }

    #[test]
    fn test_cue_file_without_index_yields_nothing() {
        let root = TempDir::new().unwrap();
        touch(root.path(), "album.flac");
        touch(root.path(), "album.cue");
        touch(root.path(), "single.flac");

        let scratch = TempDir::new().unwrap();
        let jobs = discover(root.path(), &no_index(scratch.path()));
        let keys: Vec<&str> = jobs.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["single.flac"]);
    }

    #[test]
    fn test_missing_root() {
        let scratch = TempDir::new().unwrap();
        assert!(discover(Path::new("/nonexistent/library"), &no_index(scratch.path())).is_empty());
    }

    #[test]
    fn test_pending_jobs_resume() {
        let mut store = TrackStore::open_in_memory().unwrap();
        store
            .add(&TrackRecord {
                key: "done.mp3".to_string(),
                tags: TagSet::default(),
                features: FeatureVector::default(),
            })
            .unwrap();

        let jobs = vec![
            CandidateJob::plain("/m/done.mp3".into(), "done.mp3".to_string()),
            CandidateJob::plain("/m/new.mp3".into(), "new.mp3".to_string()),
        ];

        let full = pending_jobs(jobs.clone(), false, &store).unwrap();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].key, "new.mp3");

        let meta = pending_jobs(jobs, true, &store).unwrap();
        assert_eq!(meta.len(), 2);
    }
}
