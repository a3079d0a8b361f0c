//! Safety checks run before the store is opened for writing.
//!
//! The library index is owned by the media server and only ever read; the
//! track store must never be pointed at it.

use anyhow::{bail, Result};
use std::path::Path;

/// Validates that the track store path is safe to write.
///
/// Fails when the store path is the library index itself, either literally or
/// after resolving both paths on disk.
pub fn validate_store_path(db: &Path, lmsdb: Option<&Path>) -> Result<()> {
    let Some(lmsdb) = lmsdb else {
        return Ok(());
    };

    if db == lmsdb {
        bail!(
            "Safety check failed: store '{}' cannot be the same as library index '{}'",
            db.display(),
            lmsdb.display()
        );
    }

    // Either side may not exist yet; only compare what resolves.
    if let (Ok(a), Ok(b)) = (db.canonicalize(), lmsdb.canonicalize()) {
        if a == b {
            bail!(
                "Safety check failed: store '{}' resolves to library index '{}'",
                db.display(),
                b.display()
            );
        }
    }

    Ok(())
}
