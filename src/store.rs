//! Track store.
//!
//! Single-writer SQLite store keyed by store key. All writes happen on the
//! coordinating thread; transactions are opened lazily and committed every
//! `COMMIT_BATCH_SIZE` writes, plus once at the end of a run.
//!
//! ```sql
//! CREATE TABLE tracks (
//!     file varchar PRIMARY KEY NOT NULL,
//!     title, artist, album, albumartist, genre, duration, ignore,
//!     danceable, aggressive, electronic, acoustic, happy, party,
//!     relaxed, sad, dark, tonal, voice, bpm
//! );
//! ```

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::cue::source_key;
use crate::models::{FeatureVector, TagSet, TrackRecord, GENRE_SEPARATOR};

/// Writes between intermediate commits.
pub const COMMIT_BATCH_SIZE: usize = 750;

/// Every column beyond `file`, with its declared type. Older stores missing
/// any of these get them added on open.
const COLUMNS: &[(&str, &str)] = &[
    ("title", "varchar"),
    ("artist", "varchar"),
    ("album", "varchar"),
    ("albumartist", "varchar"),
    ("genre", "varchar"),
    ("duration", "integer"),
    ("ignore", "integer"),
    ("danceable", "real"),
    ("aggressive", "real"),
    ("electronic", "real"),
    ("acoustic", "real"),
    ("happy", "real"),
    ("party", "real"),
    ("relaxed", "real"),
    ("sad", "real"),
    ("dark", "real"),
    ("tonal", "real"),
    ("voice", "real"),
    ("bpm", "integer"),
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("'{0}' is already analysed")]
    AlreadyAnalysed(String),
}

/// Tag columns that bulk maintenance may rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagColumn {
    Artist,
    AlbumArtist,
    Album,
}

impl TagColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            TagColumn::Artist => "artist",
            TagColumn::AlbumArtist => "albumartist",
            TagColumn::Album => "album",
        }
    }
}

/// A row as read back from the store. Features are absent for rows that
/// only ever received a metadata refresh.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredTrack {
    pub key: String,
    pub tags: TagSet,
    pub features: Option<FeatureVector>,
    pub ignore: bool,
}

fn stored_track_from_row(row: &Row) -> rusqlite::Result<StoredTrack> {
    let genre: Option<String> = row.get("genre")?;
    let danceable: Option<f64> = row.get("danceable")?;
    let features = match danceable {
        Some(danceable) => Some(FeatureVector {
            danceable,
            aggressive: row.get::<_, Option<f64>>("aggressive")?.unwrap_or_default(),
            electronic: row.get::<_, Option<f64>>("electronic")?.unwrap_or_default(),
            acoustic: row.get::<_, Option<f64>>("acoustic")?.unwrap_or_default(),
            happy: row.get::<_, Option<f64>>("happy")?.unwrap_or_default(),
            party: row.get::<_, Option<f64>>("party")?.unwrap_or_default(),
            relaxed: row.get::<_, Option<f64>>("relaxed")?.unwrap_or_default(),
            sad: row.get::<_, Option<f64>>("sad")?.unwrap_or_default(),
            dark: row.get::<_, Option<f64>>("dark")?.unwrap_or_default(),
            tonal: row.get::<_, Option<f64>>("tonal")?.unwrap_or_default(),
            voice: row.get::<_, Option<f64>>("voice")?.unwrap_or_default(),
            bpm: row.get::<_, Option<i64>>("bpm")?.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(StoredTrack {
        key: row.get("file")?,
        tags: TagSet {
            title: row.get("title")?,
            artist: row.get("artist")?,
            album: row.get("album")?,
            albumartist: row.get("albumartist")?,
            genres: genre.map(|g| g.split(GENRE_SEPARATOR).map(String::from).collect()),
            duration: row.get::<_, Option<i64>>("duration")?.unwrap_or_default(),
        },
        features,
        ignore: row.get::<_, Option<i64>>("ignore")?.unwrap_or_default() != 0,
    })
}

pub struct TrackStore {
    conn: Connection,
    pending: usize,
    commits: usize,
}

impl TrackStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        tracing::debug!("DB: {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn,
            pending: 0,
            commits: 0,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create the table if needed and add any columns an older store lacks.
    fn init_schema(&self) -> Result<(), StoreError> {
        let columns: Vec<String> = COLUMNS
            .iter()
            .map(|(name, ty)| format!("{} {}", name, ty))
            .collect();
        self.conn.execute_batch(&format!(
            "PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS tracks (
                file varchar PRIMARY KEY NOT NULL,
                {}
             );
             CREATE UNIQUE INDEX IF NOT EXISTS tracks_idx ON tracks(file);",
            columns.join(",\n                ")
        ))?;

        let existing: HashSet<String> = {
            let mut stmt = self.conn.prepare("PRAGMA table_info(tracks)")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<_, _>>()?;
            names
        };

        for (name, ty) in COLUMNS {
            if !existing.contains(*name) {
                tracing::info!("Adding missing column '{}' to tracks", name);
                self.conn.execute(
                    &format!("ALTER TABLE tracks ADD COLUMN {} {} default null", name, ty),
                    [],
                )?;
            }
        }
        Ok(())
    }

    fn begin_if_needed(&self) -> Result<(), StoreError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    fn wrote(&mut self) -> Result<(), StoreError> {
        self.pending += 1;
        if self.pending >= COMMIT_BATCH_SIZE {
            tracing::debug!("Committing DB changes");
            self.commit()?;
        }
        Ok(())
    }

    /// Write a fully analysed track. A row holding only metadata is filled
    /// in (its ignore flag kept); a row that already has features is left
    /// alone and reported, since callers only add keys not yet analysed.
    pub fn add(&mut self, record: &TrackRecord) -> Result<(), StoreError> {
        self.begin_if_needed()?;
        let tags = &record.tags;
        let f = &record.features;
        let changed = self
            .conn
            .prepare_cached(
                "INSERT INTO tracks (file, title, artist, album, albumartist, genre, duration,
                     ignore, danceable, aggressive, electronic, acoustic, happy, party,
                     relaxed, sad, dark, tonal, voice, bpm)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT(file) DO UPDATE SET
                     title = excluded.title, artist = excluded.artist,
                     album = excluded.album, albumartist = excluded.albumartist,
                     genre = excluded.genre, duration = excluded.duration,
                     danceable = excluded.danceable, aggressive = excluded.aggressive,
                     electronic = excluded.electronic, acoustic = excluded.acoustic,
                     happy = excluded.happy, party = excluded.party,
                     relaxed = excluded.relaxed, sad = excluded.sad, dark = excluded.dark,
                     tonal = excluded.tonal, voice = excluded.voice, bpm = excluded.bpm
                 WHERE tracks.danceable IS NULL",
            )?
            .execute(params![
                record.key,
                tags.title,
                tags.artist,
                tags.album,
                tags.albumartist,
                tags.genre_column(),
                tags.duration,
                f.danceable,
                f.aggressive,
                f.electronic,
                f.acoustic,
                f.happy,
                f.party,
                f.relaxed,
                f.sad,
                f.dark,
                f.tonal,
                f.voice,
                f.bpm,
            ])?;
        if changed == 0 {
            return Err(StoreError::AlreadyAnalysed(record.key.clone()));
        }
        self.wrote()
    }

    /// Refresh tag columns only. Returns whether a row was touched.
    pub fn update(&mut self, key: &str, tags: &TagSet) -> Result<bool, StoreError> {
        self.begin_if_needed()?;
        let changed = self
            .conn
            .prepare_cached(
                "UPDATE tracks SET title = ?1, artist = ?2, album = ?3, albumartist = ?4,
                     genre = ?5, duration = ?6
                 WHERE file = ?7",
            )?
            .execute(params![
                tags.title,
                tags.artist,
                tags.album,
                tags.albumartist,
                tags.genre_column(),
                tags.duration,
                key,
            ])?;
        self.wrote()?;
        Ok(changed > 0)
    }

    /// Delete rows whose source file no longer exists under `root`.
    /// CUE sub-track keys are checked against their physical file.
    pub fn remove_old_tracks(&mut self, root: &Path) -> Result<bool, StoreError> {
        tracing::debug!("Looking for old tracks to remove");
        let keys = self.keys()?;
        let stale: Vec<&String> = keys
            .iter()
            .filter(|key| {
                let gone = !root.join(source_key(key)).exists();
                if gone {
                    tracing::debug!("'{}' no longer exists", key);
                }
                gone
            })
            .collect();

        tracing::debug!("Num old tracks: {}", stale.len());
        if stale.is_empty() {
            return Ok(false);
        }

        self.begin_if_needed()?;
        let mut stmt = self.conn.prepare_cached("DELETE FROM tracks WHERE file = ?1")?;
        for key in stale {
            stmt.execute(params![key])?;
        }
        Ok(true)
    }

    /// True only when the row exists and carries features. Only `danceable`
    /// is consulted; a row with partially written feature columns would
    /// still count as analysed.
    pub fn file_already_analysed(&self, key: &str) -> Result<bool, StoreError> {
        let found = self
            .conn
            .prepare_cached("SELECT 1 FROM tracks WHERE file = ?1 AND danceable IS NOT NULL")?
            .query_row(params![key], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Commit the open transaction, if any.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
            self.commits += 1;
        }
        self.pending = 0;
        Ok(())
    }

    /// Number of transactions committed so far.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT file FROM tracks")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(keys)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn get(&self, key: &str) -> Result<Option<StoredTrack>, StoreError> {
        let track = self
            .conn
            .query_row(
                "SELECT * FROM tracks WHERE file = ?1",
                params![key],
                stored_track_from_row,
            )
            .optional()?;
        Ok(track)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Clear every ignore flag, then set it on rows whose key starts with
    /// one of `prefixes`. Returns the number of rows flagged.
    pub fn apply_ignore_list(&mut self, prefixes: &[String]) -> Result<usize, StoreError> {
        self.begin_if_needed()?;
        self.conn.execute("UPDATE tracks SET ignore = 0", [])?;
        let mut flagged = 0;
        for prefix in prefixes {
            tracing::info!("Ignore: {}", prefix);
            flagged += self.conn.execute(
                "UPDATE tracks SET ignore = 1 WHERE substr(file, 1, length(?1)) = ?1",
                params![prefix],
            )?;
        }
        self.commit()?;
        Ok(flagged)
    }

    /// Rewrite each distinct non-null value of `column` through `f`.
    /// Returns the number of distinct values changed.
    pub fn rewrite_column<F>(&mut self, column: TagColumn, f: F) -> Result<usize, StoreError>
    where
        F: Fn(&str) -> String,
    {
        let name = column.as_str();
        let values: Vec<String> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT DISTINCT {name} FROM tracks WHERE {name} IS NOT NULL"
            ))?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            rows
        };

        self.begin_if_needed()?;
        let mut changed = 0;
        for value in values {
            let updated = f(&value);
            if updated != value {
                self.conn.execute(
                    &format!("UPDATE tracks SET {name} = ?1 WHERE {name} = ?2"),
                    params![updated, value],
                )?;
                changed += 1;
            }
        }
        self.commit()?;
        Ok(changed)
    }
}
