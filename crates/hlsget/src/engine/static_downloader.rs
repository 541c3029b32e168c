use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::{DownloadReport, SegmentDownloadEngine, SegmentRun, fetch_manifest};
use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::manifest::Manifest;
use crate::transport::Transport;

/// Downloads every segment of a finished (VOD) playlist. The playlist is read once.
pub struct StaticSegmentDownloader {
    transport: Arc<dyn Transport>,
    playlist_url: Url,
    segments_dir: PathBuf,
    config: EngineConfig,
}

impl StaticSegmentDownloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        playlist_url: Url,
        segments_dir: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            playlist_url,
            segments_dir: segments_dir.into(),
            config,
        }
    }

    fn unreachable(&self, reason: impl ToString) -> DownloadError {
        DownloadError::ManifestUnreachable {
            url: self.playlist_url.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl SegmentDownloadEngine for StaticSegmentDownloader {
    async fn start(&mut self, token: CancellationToken) -> Result<DownloadReport> {
        let manifest = fetch_manifest(
            self.transport.as_ref(),
            &self.playlist_url,
            &self.config.retry_policy(),
            &token,
        )
        .await
        .map_err(|e| match e {
            DownloadError::Cancelled => DownloadError::Cancelled,
            other => self.unreachable(other),
        })?;

        let media = match manifest {
            Manifest::Media(media) => media,
            Manifest::Variant(_) => {
                return Err(self.unreachable("expected a media playlist, got a master playlist"));
            }
        };

        let mut run = SegmentRun::new(
            Arc::clone(&self.transport),
            &self.config,
            &self.segments_dir,
        );
        for segment in media.segments {
            run.schedule(&self.playlist_url, segment);
        }
        info!(
            url = %self.playlist_url,
            segments = run.state().attempted.len(),
            concurrency = self.config.effective_concurrency(),
            "Starting static download"
        );
        run.dispatch();

        let mut cancelled = false;
        while !run.is_idle() {
            tokio::select! {
                biased;
                _ = token.cancelled(), if !cancelled => {
                    info!("Download cancelled, waiting for in-flight segments");
                    cancelled = true;
                    run.halt();
                }
                Some(outcome) = run.next_outcome() => {
                    run.handle_outcome(outcome);
                    run.dispatch();
                }
                else => break,
            }
        }

        if cancelled {
            return Err(DownloadError::Cancelled);
        }

        let state = run.state();
        debug!(
            completed = state.completed.len(),
            failed = state.failed.len(),
            bytes = state.bytes_written,
            "Static download finished"
        );
        run.finish(false)
    }
}
