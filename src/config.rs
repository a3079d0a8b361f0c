//! Analyzer configuration.
//!
//! The configuration is a JSON object. Keys the analyzer does not know are
//! kept as pass-through values for other consumers of the same file.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_THREADS: usize = 8;
pub const DEFAULT_DB: &str = "essentia.db";
pub const DEFAULT_DECODER: &str = "ffmpeg";

/// Keys whose values are never given a trailing separator.
const UNNORMALIZED_KEYS: &[&str] = &[
    "threads",
    "extractor",
    "port",
    "genres",
    "db",
    "lmsdb",
    "stop",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} does not exist")]
    FileMissing(PathBuf),

    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("'{0}' not in config file")]
    MissingKey(&'static str),

    #[error("'{0}' does not exist")]
    PathMissing(String),
}

#[derive(Deserialize)]
struct RawConfig {
    essentia: Option<String>,
    lms: Option<String>,
    extractor: Option<String>,
    db: Option<String>,
    lmsdb: Option<String>,
    tmp: Option<String>,
    json_cache: Option<String>,
    threads: Option<usize>,
    stop: Option<String>,
    normalize_tags: Option<bool>,
    decoder: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Validated configuration record consumed by the indexer.
///
/// Directory-valued options (`essentia`, `lms`, `tmp`, `json_cache`) always
/// end with `/` so store keys can be taken as suffixes of absolute paths.
#[derive(Clone, Debug)]
pub struct Config {
    pub essentia: String,
    pub lms: String,
    pub extractor: PathBuf,
    pub db: PathBuf,
    pub lmsdb: Option<PathBuf>,
    pub tmp: Option<String>,
    pub json_cache: Option<String>,
    pub threads: usize,
    pub stop: Option<PathBuf>,
    pub normalize_tags: bool,
    pub decoder: String,
    pub extra: Map<String, Value>,
}

/// Append a trailing `/` unless one is already present.
pub fn with_trailing_separator(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileMissing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse and validate configuration JSON.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;

        let extractor = raw.extractor.ok_or(ConfigError::MissingKey("extractor"))?;
        let essentia = raw.essentia.ok_or(ConfigError::MissingKey("essentia"))?;
        let lms = raw.lms.ok_or(ConfigError::MissingKey("lms"))?;

        for required in [&essentia, &lms] {
            if !Path::new(required).exists() {
                return Err(ConfigError::PathMissing(required.clone()));
            }
        }
        for optional in [&raw.tmp, &raw.json_cache].into_iter().flatten() {
            if !Path::new(optional).exists() {
                return Err(ConfigError::PathMissing(optional.clone()));
            }
        }

        let extra = raw
            .extra
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) if !UNNORMALIZED_KEYS.contains(&key.as_str()) => {
                    (key, Value::String(with_trailing_separator(&s)))
                }
                other => (key, other),
            })
            .collect();

        Ok(Config {
            essentia: with_trailing_separator(&essentia),
            lms: with_trailing_separator(&lms),
            extractor: PathBuf::from(extractor),
            db: PathBuf::from(raw.db.unwrap_or_else(|| DEFAULT_DB.to_string())),
            lmsdb: raw.lmsdb.map(PathBuf::from),
            tmp: raw.tmp.as_deref().map(with_trailing_separator),
            json_cache: raw.json_cache.as_deref().map(with_trailing_separator),
            threads: raw.threads.filter(|t| *t > 0).unwrap_or(DEFAULT_THREADS),
            stop: raw.stop.map(PathBuf::from),
            normalize_tags: raw.normalize_tags.unwrap_or(false),
            decoder: raw.decoder.unwrap_or_else(|| DEFAULT_DECODER.to_string()),
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_json(dir: &TempDir, extra: &str) -> String {
        let root = dir.path().display();
        format!(
            r#"{{"essentia": "{root}", "lms": "{root}", "extractor": "/usr/bin/extractor"{extra}}}"#
        )
    }

    #[test]
    fn test_defaults_and_trailing_separator() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_json(&config_json(&dir, "")).unwrap();

        assert_eq!(config.threads, DEFAULT_THREADS);
        assert!(config.essentia.ends_with('/'));
        assert!(config.lms.ends_with('/'));
        assert_eq!(config.db, PathBuf::from(DEFAULT_DB));
        assert_eq!(config.extractor, PathBuf::from("/usr/bin/extractor"));
        assert!(!config.normalize_tags);
        assert_eq!(config.decoder, DEFAULT_DECODER);
    }

    #[test]
    fn test_passthrough_keys() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_json(&config_json(
            &dir,
            r#", "port": "11000", "genres": "x", "other": "/srv/data", "threads": 2"#,
        ))
        .unwrap();

        assert_eq!(config.threads, 2);
        assert_eq!(config.extra["port"], Value::String("11000".to_string()));
        assert_eq!(config.extra["genres"], Value::String("x".to_string()));
        assert_eq!(config.extra["other"], Value::String("/srv/data/".to_string()));
    }

    #[test]
    fn test_missing_extractor() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().display();
        let json = format!(r#"{{"essentia": "{root}", "lms": "{root}"}}"#);
        let err = Config::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("'extractor' not in config file"));
    }

    #[test]
    fn test_missing_library_root() {
        let json = r#"{"essentia": "/nonexistent/music", "lms": "/tmp", "extractor": "x"}"#;
        assert!(matches!(Config::from_json(json), Err(ConfigError::PathMissing(_))));
    }

    #[test]
    fn test_missing_cache_dir() {
        let dir = TempDir::new().unwrap();
        let err = Config::from_json(&config_json(&dir, r#", "json_cache": "/nonexistent/cache""#));
        assert!(matches!(err, Err(ConfigError::PathMissing(_))));
    }

    #[test]
    fn test_unparsable() {
        assert!(matches!(Config::from_json("{not json"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/config.json"));
        assert!(matches!(err, Err(ConfigError::FileMissing(_))));
    }
}
