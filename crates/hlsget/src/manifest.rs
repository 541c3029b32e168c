//! In-memory playlist model.
//!
//! A [`Manifest`] is built once per fetch and never mutated afterwards; a live
//! poll produces a fresh value every time.

use m3u8_rs::{MasterPlaylist, MediaPlaylist, parse_playlist_res};

use crate::error::{DownloadError, Result};

/// One quality rendition advertised by a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEntry {
    pub uri: String,
    /// Peak bits per second (`BANDWIDTH` attribute)
    pub bandwidth: u64,
    /// `RESOLUTION` attribute as `(width, height)`, informational only
    pub resolution: Option<(u64, u64)>,
}

/// One fetchable media chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// `EXT-X-MEDIA-SEQUENCE` plus the position in the playlist
    pub sequence_number: u64,
    pub uri: String,
    /// Duration in seconds (`EXTINF`)
    pub duration: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaManifest {
    /// Segments in publication order, sequence numbers strictly increasing
    pub segments: Vec<Segment>,
    /// `EXT-X-ENDLIST` was present: no further segments will be published
    pub ended: bool,
    pub target_duration: u64,
}

impl MediaManifest {
    /// Sequence number of the newest segment (the live edge).
    pub fn latest_sequence(&self) -> Option<u64> {
        self.segments.last().map(|s| s.sequence_number)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Variant(Vec<VariantEntry>),
    Media(MediaManifest),
}

impl Manifest {
    pub fn is_variant(&self) -> bool {
        matches!(self, Manifest::Variant(_))
    }

    /// At least one variant entry or at least one segment.
    pub fn has_content(&self) -> bool {
        match self {
            Manifest::Variant(variants) => !variants.is_empty(),
            Manifest::Media(media) => !media.segments.is_empty(),
        }
    }

    pub fn into_media(self) -> Option<MediaManifest> {
        match self {
            Manifest::Media(media) => Some(media),
            Manifest::Variant(_) => None,
        }
    }
}

impl From<MasterPlaylist> for Manifest {
    fn from(playlist: MasterPlaylist) -> Self {
        let variants = playlist
            .variants
            .into_iter()
            // I-frame only renditions cannot be merged into a playable file
            .filter(|v| !v.is_i_frame)
            .map(|v| VariantEntry {
                uri: v.uri,
                bandwidth: v.bandwidth,
                resolution: v.resolution.map(|r| (r.width, r.height)),
            })
            .collect();
        Manifest::Variant(variants)
    }
}

impl TryFrom<MediaPlaylist> for Manifest {
    type Error = DownloadError;

    fn try_from(playlist: MediaPlaylist) -> Result<Self> {
        let base = playlist.media_sequence;
        let segments = playlist
            .segments
            .into_iter()
            .enumerate()
            .map(|(idx, segment)| {
                let sequence_number = base.checked_add(idx as u64).ok_or_else(|| {
                    DownloadError::parse(format!(
                        "media sequence {base} overflows at segment {idx}"
                    ))
                })?;
                Ok(Segment {
                    sequence_number,
                    uri: segment.uri,
                    duration: segment.duration,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Manifest::Media(MediaManifest {
            segments,
            ended: playlist.end_list,
            target_duration: playlist.target_duration as u64,
        }))
    }
}

/// Parse raw playlist bytes into a [`Manifest`].
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    match parse_playlist_res(bytes) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => Ok(pl.into()),
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => pl.try_into(),
        Err(e) => Err(DownloadError::parse(format!("failed to parse playlist: {e}"))),
    }
}
