//! One complete run: select a variant, download its segments, merge and transmux.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::{EngineConfig, HttpConfig, LiveConfig};
use crate::engine::{
    DownloadReport, LiveSegmentDownloader, SegmentDownloadEngine, StaticSegmentDownloader,
};
use crate::error::{DownloadError, Result};
use crate::output::{self, MergeStrategy};
use crate::selector::{Quality, VariantSelector};
use crate::transport::{HttpTransport, Transport};

/// Directory under the system temp dir holding every run's scratch files.
const TEMP_ROOT: &str = "hlsget";

/// Identifier scoping the temporary files of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a run needs.
#[derive(Debug, Clone)]
pub struct GrabConfig {
    pub stream_url: String,
    /// Required when `stream_url` points at a master playlist
    pub quality: Option<Quality>,
    /// Follow the playlist as a live stream instead of reading it once
    pub live: bool,
    pub output_file: PathBuf,
    pub engine: EngineConfig,
    pub live_config: LiveConfig,
    pub http: HttpConfig,
    /// Segment directory, defaults to `<tmp>/hlsget/<run-id>/`
    pub segments_dir: Option<PathBuf>,
    /// Intermediate merged file, defaults to `<tmp>/hlsget/<run-id>.ts`
    pub merged_file: Option<PathBuf>,
    pub merge_strategy: MergeStrategy,
    pub ffmpeg_path: PathBuf,
    /// Repackage the merged file with ffmpeg. When false the merged file becomes the output.
    pub transmux: bool,
    /// Keep the segment directory and merged file after a successful run
    pub keep_segments: bool,
    pub run_id: RunId,
}

impl GrabConfig {
    pub fn new(stream_url: impl Into<String>, output_file: impl Into<PathBuf>) -> Self {
        Self {
            stream_url: stream_url.into(),
            quality: None,
            live: false,
            output_file: output_file.into(),
            engine: EngineConfig::default(),
            live_config: LiveConfig::default(),
            http: HttpConfig::default(),
            segments_dir: None,
            merged_file: None,
            merge_strategy: MergeStrategy::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            transmux: true,
            keep_segments: false,
            run_id: RunId::random(),
        }
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.segments_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir()
                .join(TEMP_ROOT)
                .join(self.run_id.as_str())
        })
    }

    pub fn merged_file(&self) -> PathBuf {
        self.merged_file.clone().unwrap_or_else(|| {
            std::env::temp_dir()
                .join(TEMP_ROOT)
                .join(format!("{}.ts", self.run_id))
        })
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub run_id: RunId,
    /// Media playlist the segments came from
    pub playlist_url: Url,
    pub output_file: PathBuf,
    /// Number of segment files merged
    pub segments: usize,
    pub report: DownloadReport,
}

/// Run a download over HTTP.
pub async fn download(config: GrabConfig, token: CancellationToken) -> Result<DownloadSummary> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.http)?);
    download_with_transport(config, transport, token).await
}

/// Run a download through the given transport.
pub async fn download_with_transport(
    config: GrabConfig,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
) -> Result<DownloadSummary> {
    let stream_url = Url::parse(config.stream_url.trim())
        .map_err(|e| DownloadError::invalid_url(&config.stream_url, e))?;
    let retry_policy = config.engine.retry_policy();

    let mut selector = VariantSelector::new(Arc::clone(&transport), stream_url, retry_policy);
    if !selector.load(&token).await? {
        return Err(DownloadError::NoContentFound {
            url: config.stream_url.clone(),
        });
    }
    let playlist_url = selector.resolve(config.quality)?;

    let segments_dir = config.segments_dir();
    let merged_file = config.merged_file();
    tokio::fs::create_dir_all(&segments_dir).await?;
    create_parent_dir(&merged_file).await?;
    create_parent_dir(&config.output_file).await?;

    info!(
        run_id = %config.run_id,
        playlist = %playlist_url,
        live = config.live,
        segments_dir = %segments_dir.display(),
        "Starting download"
    );

    let mut engine: Box<dyn SegmentDownloadEngine> = if config.live {
        Box::new(LiveSegmentDownloader::new(
            Arc::clone(&transport),
            playlist_url.clone(),
            &segments_dir,
            config.engine.clone(),
            config.live_config.clone(),
        ))
    } else {
        Box::new(StaticSegmentDownloader::new(
            Arc::clone(&transport),
            playlist_url.clone(),
            &segments_dir,
            config.engine.clone(),
        ))
    };
    let report = engine.start(token).await?;

    if !report.failed.is_empty() {
        warn!(
            failed = report.failed.len(),
            "Some segments could not be downloaded, the output will have gaps"
        );
    }

    let files = output::sorted_segment_files(&segments_dir).await?;
    if files.is_empty() {
        return Err(DownloadError::NoContentFound {
            url: playlist_url.to_string(),
        });
    }

    output::merge_segments(
        config.merge_strategy,
        &config.ffmpeg_path,
        &files,
        &merged_file,
    )
    .await?;

    if config.transmux {
        output::transmux(&config.ffmpeg_path, &merged_file, &config.output_file).await?;
        if !config.keep_segments {
            remove_quietly(&merged_file).await;
        }
    } else if config.keep_segments {
        tokio::fs::copy(&merged_file, &config.output_file).await?;
    } else {
        output::move_file(&merged_file, &config.output_file).await?;
    }

    if !config.keep_segments {
        if let Err(e) = tokio::fs::remove_dir_all(&segments_dir).await {
            warn!(path = %segments_dir.display(), error = %e, "Failed to remove segment directory");
        }
    }

    info!(
        output = %config.output_file.display(),
        segments = files.len(),
        bytes = report.bytes_written,
        "Download complete"
    );

    Ok(DownloadSummary {
        run_id: config.run_id,
        playlist_url,
        output_file: config.output_file,
        segments: files.len(),
        report,
    })
}

async fn create_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::create_dir_all(parent).await?;
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
    }
}
