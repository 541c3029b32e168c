//! Variant (quality) resolution over a loaded manifest.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::engine::fetch_manifest;
use crate::error::{DownloadError, Result};
use crate::manifest::{Manifest, VariantEntry};
use crate::retry::RetryPolicy;
use crate::transport::Transport;

/// Quality criterion used to pick one variant of a master playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// Highest bandwidth
    Best,
    /// Lowest bandwidth
    Worst,
    /// Highest bandwidth not above this many bits per second
    Bandwidth(u64),
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("best") {
            Ok(Quality::Best)
        } else if s.eq_ignore_ascii_case("worst") {
            Ok(Quality::Worst)
        } else {
            s.parse::<u64>().map(Quality::Bandwidth).map_err(|_| {
                format!("invalid quality `{s}`, expected `best`, `worst` or a bandwidth in bit/s")
            })
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Best => f.write_str("best"),
            Quality::Worst => f.write_str("worst"),
            Quality::Bandwidth(bw) => write!(f, "{bw}"),
        }
    }
}

/// Pick the winning variant. Ties keep the entry listed first.
pub fn select_variant(variants: &[VariantEntry], quality: Quality) -> Option<&VariantEntry> {
    let mut iter = variants.iter();
    let first = iter.next()?;
    let winner = match quality {
        Quality::Best => iter.fold(first, |prev, cur| {
            if cur.bandwidth > prev.bandwidth { cur } else { prev }
        }),
        Quality::Worst => iter.fold(first, |prev, cur| {
            if cur.bandwidth < prev.bandwidth { cur } else { prev }
        }),
        Quality::Bandwidth(target) => {
            let under_target = variants
                .iter()
                .filter(|v| v.bandwidth <= target)
                .fold(None::<&VariantEntry>, |prev, cur| match prev {
                    Some(p) if p.bandwidth >= cur.bandwidth => Some(p),
                    _ => Some(cur),
                });
            // Nothing fits under the target: fall back to the smallest rendition.
            match under_target {
                Some(v) => v,
                None => return select_variant(variants, Quality::Worst),
            }
        }
    };
    Some(winner)
}

/// Loads the manifest behind a stream URL and resolves the media playlist to download.
pub struct VariantSelector {
    transport: Arc<dyn Transport>,
    stream_url: Url,
    retry_policy: RetryPolicy,
    manifest: Option<Manifest>,
}

impl VariantSelector {
    pub fn new(transport: Arc<dyn Transport>, stream_url: Url, retry_policy: RetryPolicy) -> Self {
        Self {
            transport,
            stream_url,
            retry_policy,
            manifest: None,
        }
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    /// Fetch and parse the manifest. Returns whether it lists at least one
    /// segment or at least one variant.
    pub async fn load(&mut self, token: &CancellationToken) -> Result<bool> {
        let manifest = fetch_manifest(
            self.transport.as_ref(),
            &self.stream_url,
            &self.retry_policy,
            token,
        )
        .await
        .map_err(|e| match e {
            DownloadError::Cancelled => DownloadError::Cancelled,
            other => DownloadError::ManifestUnreachable {
                url: self.stream_url.to_string(),
                reason: other.to_string(),
            },
        })?;

        let has_content = manifest.has_content();
        match &manifest {
            Manifest::Variant(variants) => {
                debug!(url = %self.stream_url, variants = variants.len(), "Loaded master playlist")
            }
            Manifest::Media(media) => {
                debug!(url = %self.stream_url, segments = media.segments.len(), ended = media.ended, "Loaded media playlist")
            }
        }
        self.manifest = Some(manifest);
        Ok(has_content)
    }

    pub fn is_master(&self) -> Result<bool> {
        self.manifest
            .as_ref()
            .map(Manifest::is_variant)
            .ok_or(DownloadError::NotLoaded)
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Resolve the URL of the media playlist to download.
    pub fn resolve(&self, quality: Option<Quality>) -> Result<Url> {
        let manifest = self.manifest.as_ref().ok_or(DownloadError::NotLoaded)?;

        let variants = match manifest {
            // Already a leaf playlist
            Manifest::Media(media) if !media.segments.is_empty() => {
                return Ok(self.stream_url.clone());
            }
            Manifest::Variant(variants) if !variants.is_empty() => variants,
            _ => {
                error!(url = %self.stream_url, "No stream or playlist found");
                return Err(DownloadError::NoContentFound {
                    url: self.stream_url.to_string(),
                });
            }
        };

        let Some(quality) = quality else {
            error!(
                url = %self.stream_url,
                variants = variants.len(),
                "A quality is required with a master playlist"
            );
            return Err(DownloadError::MissingQuality {
                url: self.stream_url.to_string(),
                variants: variants.len(),
            });
        };

        let winner = select_variant(variants, quality).ok_or_else(|| {
            DownloadError::NoContentFound {
                url: self.stream_url.to_string(),
            }
        })?;

        let playlist_url = self
            .stream_url
            .join(&winner.uri)
            .map_err(|e| DownloadError::invalid_url(&winner.uri, e))?;

        info!(
            quality = %quality,
            bandwidth = winner.bandwidth,
            resolution = ?winner.resolution,
            url = %playlist_url,
            "Selected variant"
        );
        Ok(playlist_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::fixtures::{master_playlist, media_playlist};
    use crate::transport::mock::MockTransport;
    use rstest::rstest;

    const MASTER_URL: &str = "https://cdn.example.com/live/master.m3u8";

    fn entry(uri: &str, bandwidth: u64) -> VariantEntry {
        VariantEntry {
            uri: uri.to_string(),
            bandwidth,
            resolution: None,
        }
    }

    fn ladder() -> Vec<VariantEntry> {
        vec![
            entry("mid.m3u8", 1_500_000),
            entry("low.m3u8", 400_000),
            entry("high.m3u8", 6_000_000),
            entry("high-dup.m3u8", 6_000_000),
            entry("low-dup.m3u8", 400_000),
        ]
    }

    #[rstest]
    #[case(Quality::Best, "high.m3u8")]
    #[case(Quality::Worst, "low.m3u8")]
    #[case(Quality::Bandwidth(2_000_000), "mid.m3u8")]
    #[case(Quality::Bandwidth(6_000_000), "high.m3u8")]
    #[case(Quality::Bandwidth(400_000), "low.m3u8")]
    #[case(Quality::Bandwidth(100), "low.m3u8")]
    fn selects_expected_variant(#[case] quality: Quality, #[case] expected: &str) {
        let variants = ladder();
        assert_eq!(select_variant(&variants, quality).unwrap().uri, expected);
    }

    #[test]
    fn numeric_target_compares_numbers_not_strings() {
        // "900000" > "1000000" as strings; numerically 1_000_000 is the closer fit
        let variants = vec![entry("a.m3u8", 900_000), entry("b.m3u8", 1_000_000)];
        let winner = select_variant(&variants, Quality::Bandwidth(1_200_000)).unwrap();
        assert_eq!(winner.uri, "b.m3u8");
    }

    #[test]
    fn empty_variant_list_selects_nothing() {
        assert!(select_variant(&[], Quality::Best).is_none());
    }

    #[rstest]
    #[case("best", Quality::Best)]
    #[case("WORST", Quality::Worst)]
    #[case(" 1280000 ", Quality::Bandwidth(1_280_000))]
    fn parses_quality(#[case] input: &str, #[case] expected: Quality) {
        assert_eq!(input.parse::<Quality>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_quality() {
        assert!("1080p".parse::<Quality>().is_err());
        assert!("-5".parse::<Quality>().is_err());
    }

    fn selector(transport: Arc<MockTransport>, url: &str) -> VariantSelector {
        VariantSelector::new(transport, Url::parse(url).unwrap(), RetryPolicy::default())
    }

    #[tokio::test]
    async fn media_playlist_resolves_to_itself() {
        let transport = Arc::new(MockTransport::new());
        let url = "https://cdn.example.com/vod/index.m3u8";
        transport.serve(url, media_playlist(0, 2, true));

        let mut selector = selector(transport, url);
        assert!(selector.load(&CancellationToken::new()).await.unwrap());
        assert!(!selector.is_master().unwrap());
        assert_eq!(selector.resolve(None).unwrap().as_str(), url);
    }

    #[tokio::test]
    async fn master_playlist_requires_quality() {
        let transport = Arc::new(MockTransport::new());
        transport.serve(
            MASTER_URL,
            master_playlist(&[("low/index.m3u8", 400_000), ("high/index.m3u8", 4_000_000)]),
        );

        let mut selector = selector(Arc::clone(&transport), MASTER_URL);
        assert!(selector.load(&CancellationToken::new()).await.unwrap());
        assert!(selector.is_master().unwrap());

        let err = selector.resolve(None).unwrap_err();
        assert!(matches!(err, DownloadError::MissingQuality { variants: 2, .. }));
        // Only the master playlist was requested
        assert_eq!(transport.total_requests(), 1);
    }

    #[tokio::test]
    async fn resolves_relative_variant_against_master_url() {
        let transport = Arc::new(MockTransport::new());
        transport.serve(
            MASTER_URL,
            master_playlist(&[("low/index.m3u8", 400_000), ("../hd/index.m3u8", 4_000_000)]),
        );

        let mut selector = selector(transport, MASTER_URL);
        selector.load(&CancellationToken::new()).await.unwrap();

        let best = selector.resolve(Some(Quality::Best)).unwrap();
        assert_eq!(best.as_str(), "https://cdn.example.com/hd/index.m3u8");
        // Resolution is idempotent
        assert_eq!(selector.resolve(Some(Quality::Best)).unwrap(), best);

        let worst = selector.resolve(Some(Quality::Worst)).unwrap();
        assert_eq!(worst.as_str(), "https://cdn.example.com/live/low/index.m3u8");
    }

    #[tokio::test]
    async fn empty_playlist_has_no_content() {
        let transport = Arc::new(MockTransport::new());
        let url = "https://cdn.example.com/empty.m3u8";
        transport.serve(url, "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-ENDLIST\n");

        let mut selector = selector(transport, url);
        assert!(!selector.load(&CancellationToken::new()).await.unwrap());
        assert!(matches!(
            selector.resolve(Some(Quality::Best)),
            Err(DownloadError::NoContentFound { .. })
        ));
    }

    #[test]
    fn using_selector_before_load_is_an_error() {
        let selector = selector(Arc::new(MockTransport::new()), MASTER_URL);
        assert!(matches!(selector.is_master(), Err(DownloadError::NotLoaded)));
        assert!(matches!(selector.resolve(None), Err(DownloadError::NotLoaded)));
    }

    #[tokio::test]
    async fn unreachable_manifest_is_reported() {
        let transport = Arc::new(MockTransport::new());
        let mut selector = selector(transport, MASTER_URL);
        let err = selector.load(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DownloadError::ManifestUnreachable { .. }));
    }
}
