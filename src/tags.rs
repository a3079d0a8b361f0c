//! Audio tag reading.
//!
//! A file is opened once with lofty and then offered to a ranked list of
//! container probes (MP4, ID3 on MPEG, bare ID3, Vorbis comments). The first
//! probe that yields artist and album wins.

use lofty::file::{AudioFile, FileType, TaggedFile, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey, Tag, TagType};
use std::path::Path;

use crate::models::{TagSet, GENRE_SEPARATOR};
use crate::normalize::normalize_tags;

/// Anything that can produce a tag set for an audio file.
pub trait TagSource: Send + Sync {
    /// `None` means no tag metadata is available for `path`.
    fn read_tags(&self, path: &Path, normalize: bool) -> Option<TagSet>;
}

/// One container family the reader understands.
pub trait TagProbe: Send + Sync {
    fn name(&self) -> &'static str;
    fn probe(&self, file: &TaggedFile) -> Option<TagSet>;
}

/// How a container stores multiple genres.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenreStyle {
    /// One value per item (MP4, Vorbis comments).
    MultiValued,
    /// Frames whose values may themselves be joined with the genre
    /// separator (ID3).
    Joined,
}

fn whole_seconds(file: &TaggedFile) -> i64 {
    file.properties().duration().as_secs() as i64
}

/// Map a generic tag to a tag set. Artist and album are mandatory.
pub fn tags_from(tag: &Tag, duration: i64, genre_style: GenreStyle) -> Option<TagSet> {
    let artist = tag.artist()?.to_string();
    let album = tag.album()?.to_string();

    let genres: Vec<String> = match genre_style {
        GenreStyle::MultiValued => tag.get_strings(&ItemKey::Genre).map(String::from).collect(),
        GenreStyle::Joined => tag
            .get_strings(&ItemKey::Genre)
            .flat_map(|g| g.split(GENRE_SEPARATOR))
            .map(String::from)
            .collect(),
    };

    Some(TagSet {
        title: tag.title().map(|t| t.to_string()),
        artist: Some(artist),
        album: Some(album),
        albumartist: tag.get_string(&ItemKey::AlbumArtist).map(String::from),
        genres: if genres.is_empty() { None } else { Some(genres) },
        duration,
    })
}

// ============================================================================
// Probes
// ============================================================================

pub struct Mp4Probe;

impl TagProbe for Mp4Probe {
    fn name(&self) -> &'static str {
        "MP4"
    }

    fn probe(&self, file: &TaggedFile) -> Option<TagSet> {
        if file.file_type() != FileType::Mp4 {
            return None;
        }
        let tag = file.tag(TagType::Mp4Ilst)?;
        tags_from(tag, whole_seconds(file), GenreStyle::MultiValued)
    }
}

pub struct MpegProbe;

impl TagProbe for MpegProbe {
    fn name(&self) -> &'static str {
        "MP3"
    }

    fn probe(&self, file: &TaggedFile) -> Option<TagSet> {
        if file.file_type() != FileType::Mpeg {
            return None;
        }
        let tag = file.tag(TagType::Id3v2)?;
        tags_from(tag, whole_seconds(file), GenreStyle::Joined)
    }
}

/// ID3v2 on any container; duration is not trusted here and reported as 0.
pub struct Id3Probe;

impl TagProbe for Id3Probe {
    fn name(&self) -> &'static str {
        "ID3"
    }

    fn probe(&self, file: &TaggedFile) -> Option<TagSet> {
        let tag = file.tag(TagType::Id3v2)?;
        tags_from(tag, 0, GenreStyle::Joined)
    }
}

pub struct VorbisProbe;

impl TagProbe for VorbisProbe {
    fn name(&self) -> &'static str {
        "OGG/FLAC"
    }

    fn probe(&self, file: &TaggedFile) -> Option<TagSet> {
        if !matches!(
            file.file_type(),
            FileType::Flac | FileType::Vorbis | FileType::Opus | FileType::Speex
        ) {
            return None;
        }
        let tag = file.tag(TagType::VorbisComments)?;
        tags_from(tag, whole_seconds(file), GenreStyle::MultiValued)
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct TagReader {
    probes: Vec<Box<dyn TagProbe>>,
}

impl TagReader {
    pub fn new() -> Self {
        Self::with_probes(vec![
            Box::new(Mp4Probe),
            Box::new(MpegProbe),
            Box::new(Id3Probe),
            Box::new(VorbisProbe),
        ])
    }

    pub fn with_probes(probes: Vec<Box<dyn TagProbe>>) -> Self {
        Self { probes }
    }

    pub fn probe_names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    fn open(path: &Path) -> Option<TaggedFile> {
        let probe = Probe::open(path).ok()?.guess_file_type().ok()?;
        probe.read().ok()
    }
}

impl Default for TagReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TagSource for TagReader {
    fn read_tags(&self, path: &Path, normalize: bool) -> Option<TagSet> {
        let found = Self::open(path).and_then(|file| {
            self.probes.iter().find_map(|probe| {
                let tags = probe.probe(&file)?;
                tracing::trace!(file = %path.display(), probe = probe.name(), "Read tags");
                Some(tags)
            })
        });

        match found {
            Some(tags) => Some(normalize_tags(tags, normalize)),
            None => {
                tracing::debug!("File:{} Meta:NONE", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lofty::config::WriteOptions;
    use lofty::tag::{ItemValue, TagExt, TagItem};
    use tempfile::TempDir;

    /// A FLAC stream with only a STREAMINFO block: 44.1kHz, stereo, 16 bit,
    /// 132300 samples (3 seconds).
    fn write_bare_flac(path: &Path) {
        let mut bytes = b"fLaC".to_vec();
        bytes.extend_from_slice(&[0x80, 0x00, 0x00, 0x22]);
        bytes.extend_from_slice(&[0x10, 0x00, 0x10, 0x00]);
        bytes.extend_from_slice(&[0x00; 6]);
        bytes.extend_from_slice(&[0x0A, 0xC4, 0x42, 0xF0]);
        bytes.extend_from_slice(&[0x00, 0x02, 0x04, 0xCC]);
        bytes.extend_from_slice(&[0x00; 16]);
        std::fs::write(path, bytes).unwrap();
    }

    fn vorbis_tag() -> Tag {
        let mut tag = Tag::new(TagType::VorbisComments);
        tag.set_title("Song".to_string());
        tag.set_artist("Artist".to_string());
        tag.set_album("Album".to_string());
        tag
    }

    #[test]
    fn test_tags_from_requires_artist_and_album() {
        let mut tag = Tag::new(TagType::VorbisComments);
        tag.set_artist("Artist".to_string());
        assert!(tags_from(&tag, 100, GenreStyle::MultiValued).is_none());
    }

    #[test]
    fn test_tags_from_multi_valued_genres() {
        let mut tag = vorbis_tag();
        tag.insert_text(ItemKey::AlbumArtist, "Various".to_string());
        tag.push(TagItem::new(ItemKey::Genre, ItemValue::Text("Rock".to_string())));
        tag.push(TagItem::new(ItemKey::Genre, ItemValue::Text("Pop".to_string())));

        let tags = tags_from(&tag, 215, GenreStyle::MultiValued).unwrap();
        assert_eq!(tags.title.as_deref(), Some("Song"));
        assert_eq!(tags.artist.as_deref(), Some("Artist"));
        assert_eq!(tags.album.as_deref(), Some("Album"));
        assert_eq!(tags.albumartist.as_deref(), Some("Various"));
        assert_eq!(tags.genres, Some(vec!["Rock".to_string(), "Pop".to_string()]));
        assert_eq!(tags.duration, 215);
    }

    #[test]
    fn test_tags_from_joined_genres() {
        let mut tag = vorbis_tag();
        tag.set_genre("Rock;Indie".to_string());

        let tags = tags_from(&tag, 0, GenreStyle::Joined).unwrap();
        assert_eq!(tags.genres, Some(vec!["Rock".to_string(), "Indie".to_string()]));
        assert_eq!(tags.albumartist, None);
    }

    #[test]
    fn test_joined_genres_across_frames() {
        let mut tag = vorbis_tag();
        tag.push(TagItem::new(ItemKey::Genre, ItemValue::Text("Rock;Indie".to_string())));
        tag.push(TagItem::new(ItemKey::Genre, ItemValue::Text("Jazz".to_string())));

        let tags = tags_from(&tag, 0, GenreStyle::Joined).unwrap();
        assert_eq!(
            tags.genres,
            Some(vec!["Rock".to_string(), "Indie".to_string(), "Jazz".to_string()])
        );
    }

    #[test]
    fn test_reads_vorbis_comments_from_flac() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("song.flac");
        write_bare_flac(&path);

        let mut tag = vorbis_tag();
        tag.insert_text(ItemKey::AlbumArtist, "Various".to_string());
        tag.push(TagItem::new(ItemKey::Genre, ItemValue::Text("Rock".to_string())));
        tag.push(TagItem::new(ItemKey::Genre, ItemValue::Text("Pop".to_string())));
        tag.save_to_path(&path, WriteOptions::default()).unwrap();

        let tags = TagReader::new().read_tags(&path, false).unwrap();
        assert_eq!(tags.title.as_deref(), Some("Song"));
        assert_eq!(tags.artist.as_deref(), Some("Artist"));
        assert_eq!(tags.album.as_deref(), Some("Album"));
        assert_eq!(tags.albumartist.as_deref(), Some("Various"));
        assert_eq!(tags.genres, Some(vec!["Rock".to_string(), "Pop".to_string()]));
        assert_eq!(tags.duration, 3);
    }

    #[test]
    fn test_untagged_flac_yields_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bare.flac");
        write_bare_flac(&path);
        assert!(TagReader::new().read_tags(&path, false).is_none());
    }

    #[test]
    fn test_no_genres_is_none() {
        let tags = tags_from(&vorbis_tag(), 1, GenreStyle::MultiValued).unwrap();
        assert_eq!(tags.genres, None);
    }

    #[test]
    fn test_probe_order() {
        assert_eq!(TagReader::new().probe_names(), vec!["MP4", "MP3", "ID3", "OGG/FLAC"]);
    }

    #[test]
    fn test_unreadable_files_yield_none() {
        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("not_audio.mp3");
        std::fs::write(&fake, b"definitely not an mpeg stream").unwrap();

        let reader = TagReader::new();
        assert!(reader.read_tags(&fake, false).is_none());
        assert!(reader.read_tags(&dir.path().join("missing.flac"), false).is_none());
    }
}
