//! Tag normalization shared by the analyzer and `update-db`.
//!
//! Normalization is opt-in: callers pass the flag explicitly, there is no
//! process-wide toggle.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::TagSet;

// ============================================================================
// PATTERNS
// ============================================================================

/// Featured-artist connectors collapsed to a single space in artist fields.
static FEATURING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" (?:feat|ft|featuring) ").unwrap());

/// Regex to collapse multiple whitespace into single space
pub static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

/// Edition suffixes stripped from album names by `update-db --normalize`.
/// Applied in order, before case folding.
const EDITION_SUFFIXES: &[&str] = &[
    " (Anniversary Edition)",
    " (Deluxe Edition)",
    " (Expanded Edition)",
    " (Extended Edition)",
    " (Special Edition)",
    " (Deluxe)",
    " (Deluxe Version)",
    " (Extended Deluxe)",
    " (Super Deluxe)",
    " (Re-Issue)",
    " (Remastered)",
    " (Remixed)",
    " (Remixed And  Remastered)",
];

// ============================================================================
// NORMALIZATION FUNCTIONS
// ============================================================================

/// Lower-case, drop `.`, `(` and `)`, and turn `" & "` into `" and "`.
pub fn normalize_str(s: &str) -> String {
    s.to_lowercase()
        .replace(['.', '(', ')'], "")
        .replace(" & ", " and ")
}

/// `normalize_str` plus featured-artist connectors collapsed to one space.
///
/// Replacement runs until nothing matches, so "a feat b feat c" loses both.
pub fn normalize_artist_str(s: &str) -> String {
    let mut result = normalize_str(s);
    while FEATURING.is_match(&result) {
        result = FEATURING.replace_all(&result, " ").to_string();
    }
    result
}

/// Album normalization used for bulk store cleanup: edition suffixes are
/// removed and whitespace runs collapsed.
pub fn normalize_album_str(album: &str) -> String {
    let mut result = album.to_string();
    for suffix in EDITION_SUFFIXES {
        result = result.replace(suffix, "");
    }
    MULTI_SPACE.replace_all(&normalize_str(&result), " ").to_string()
}

/// Artist normalization used for bulk store cleanup.
pub fn normalize_artist_bulk(artist: &str) -> String {
    let collapsed = MULTI_SPACE.replace_all(&normalize_str(artist), " ").to_string();
    normalize_artist_str(&collapsed)
}

/// Apply tag-read normalization to a tag set when `enabled`.
/// Title and genres are left as read.
pub fn normalize_tags(tags: TagSet, enabled: bool) -> TagSet {
    if !enabled {
        return tags;
    }
    TagSet {
        artist: tags.artist.as_deref().map(normalize_artist_str),
        albumartist: tags.albumartist.as_deref().map(normalize_artist_str),
        album: tags.album.as_deref().map(normalize_str),
        ..tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_str_basic() {
        assert_eq!(normalize_str("Mr. Big (Live)"), "mr big live");
        assert_eq!(normalize_str("Simon & Garfunkel"), "simon and garfunkel");
    }

    #[test]
    fn test_normalize_artist_featuring() {
        assert_eq!(normalize_artist_str("Artist feat. Other"), "artist other");
        assert_eq!(normalize_artist_str("Artist ft. Other"), "artist other");
        assert_eq!(normalize_artist_str("Artist Featuring Other"), "artist other");
        assert_eq!(normalize_artist_str("A feat B feat C"), "a b c");
    }

    #[test]
    fn test_normalize_artist_keeps_words_containing_feat() {
        assert_eq!(normalize_artist_str("Defeated Sanity"), "defeated sanity");
    }

    #[test]
    fn test_normalize_album_str() {
        assert_eq!(normalize_album_str("Abbey Road (Remastered)"), "abbey road");
        assert_eq!(normalize_album_str("Rumours (Deluxe Edition)"), "rumours");
        assert_eq!(normalize_album_str("A  B"), "a b");
    }

    #[test]
    fn test_normalize_artist_bulk() {
        assert_eq!(normalize_artist_bulk("Jay-Z  feat.  Beyonce"), "jay-z beyonce");
    }

    #[test]
    fn test_normalize_tags_respects_flag() {
        let tags = TagSet {
            title: Some("Song (Intro)".to_string()),
            artist: Some("Artist feat. Other".to_string()),
            album: Some("Album (Live)".to_string()),
            albumartist: Some("Band & Co.".to_string()),
            genres: None,
            duration: 10,
        };
        assert_eq!(normalize_tags(tags.clone(), false), tags);

        let normalized = normalize_tags(tags, true);
        assert_eq!(normalized.artist.as_deref(), Some("artist other"));
        assert_eq!(normalized.album.as_deref(), Some("album live"));
        assert_eq!(normalized.albumartist.as_deref(), Some("band and co"));
        assert_eq!(normalized.title.as_deref(), Some("Song (Intro)"));
    }
}
