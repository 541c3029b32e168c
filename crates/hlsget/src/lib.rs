//! # hlsget-engine
//!
//! HLS acquisition: resolve a stream URL to a media playlist, download its
//! segments (once for VOD, continuously for live streams) with bounded
//! concurrency and retries, then merge and transmux them into one file.
//!
//! ```no_run
//! use hlsget_engine::{GrabConfig, Quality, download};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> hlsget_engine::Result<()> {
//! let mut config = GrabConfig::new("https://example.com/master.m3u8", "video.mp4");
//! config.quality = Some(Quality::Best);
//! let summary = download(config, CancellationToken::new()).await?;
//! println!("{} segments", summary.segments);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod output;
pub mod retry;
pub mod selector;
pub mod transport;

pub use config::{EngineConfig, FailurePolicy, HttpConfig, LiveConfig, ProxyConfig};
pub use engine::{
    DownloadReport, LiveSegmentDownloader, SegmentDownloadEngine, SegmentFailure,
    StaticSegmentDownloader, segment_file_name,
};
pub use error::{DownloadError, Result};
pub use manifest::{Manifest, MediaManifest, Segment, VariantEntry, parse_manifest};
pub use orchestrator::{DownloadSummary, GrabConfig, RunId, download, download_with_transport};
pub use output::MergeStrategy;
pub use retry::RetryPolicy;
pub use selector::{Quality, VariantSelector, select_variant};
pub use transport::{HttpTransport, Transport, create_client, install_rustls_provider};
