// Live capture: re-poll the media playlist and follow the live edge until the
// stream ends or the token is cancelled.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
use url::Url;

use super::{DownloadReport, SegmentDownloadEngine, SegmentRun, fetch_manifest};
use crate::config::{EngineConfig, LiveConfig};
use crate::error::{DownloadError, Result};
use crate::manifest::{Manifest, MediaManifest};
use crate::transport::Transport;

pub struct LiveSegmentDownloader {
    transport: Arc<dyn Transport>,
    playlist_url: Url,
    segments_dir: PathBuf,
    config: EngineConfig,
    live: LiveConfig,
}

type PollFuture<'a> = Pin<Box<dyn Future<Output = Result<MediaManifest>> + Send + 'a>>;

/// Resolve the in-flight poll, or never if there is none.
async fn poll_in_flight(poll: &mut Option<PollFuture<'_>>) -> Result<MediaManifest> {
    match poll {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// Window tracking across polls.
#[derive(Debug, Default)]
struct EdgeTracker {
    /// Highest sequence number seen in any poll so far
    highest_seen: Option<u64>,
}

impl EdgeTracker {
    /// Lowest sequence number worth scheduling from this playlist.
    fn floor(&self, media: &MediaManifest, from_end: u64) -> Option<u64> {
        match self.highest_seen {
            Some(highest) => Some(highest.saturating_add(1)),
            // First poll with segments: start `from_end` segments back from the edge
            None => media
                .latest_sequence()
                .map(|latest| latest.saturating_add(1).saturating_sub(from_end)),
        }
    }

    fn observe(&mut self, media: &MediaManifest) {
        if let Some(latest) = media.latest_sequence() {
            self.highest_seen = Some(self.highest_seen.map_or(latest, |h| h.max(latest)));
        }
    }
}

impl LiveSegmentDownloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        playlist_url: Url,
        segments_dir: impl Into<PathBuf>,
        config: EngineConfig,
        live: LiveConfig,
    ) -> Self {
        Self {
            transport,
            playlist_url,
            segments_dir: segments_dir.into(),
            config,
            live,
        }
    }

    async fn poll(&self, token: &CancellationToken) -> Result<MediaManifest> {
        let manifest = fetch_manifest(
            self.transport.as_ref(),
            &self.playlist_url,
            &self.config.retry_policy(),
            token,
        )
        .await?;
        match manifest {
            Manifest::Media(media) => Ok(media),
            Manifest::Variant(_) => Err(DownloadError::parse(
                "expected a media playlist, got a master playlist",
            )),
        }
    }

    /// Schedule the new part of a freshly polled playlist. Returns how many jobs were queued.
    fn schedule_new(
        &self,
        run: &mut SegmentRun,
        tracker: &mut EdgeTracker,
        media: MediaManifest,
    ) -> usize {
        let Some(floor) = tracker.floor(&media, self.live.from_end) else {
            return 0;
        };
        tracker.observe(&media);

        let mut scheduled = 0;
        for segment in media.segments {
            if segment.sequence_number >= floor && run.schedule(&self.playlist_url, segment) {
                scheduled += 1;
            }
        }
        scheduled
    }
}

#[async_trait]
impl SegmentDownloadEngine for LiveSegmentDownloader {
    async fn start(&mut self, token: CancellationToken) -> Result<DownloadReport> {
        let mut run = SegmentRun::new(
            Arc::clone(&self.transport),
            &self.config,
            &self.segments_dir,
        );
        let mut tracker = EdgeTracker::default();
        let mut polling = true;
        let mut cancelled = false;
        let mut poll_error: Option<DownloadError> = None;
        let mut next_poll = Instant::now();
        // Polled alongside the pool so finished segments keep dispatching during a refresh
        let mut poll: Option<PollFuture<'_>> = None;

        info!(
            url = %self.playlist_url,
            from_end = self.live.from_end,
            refresh_interval_ms = self.live.refresh_interval.as_millis() as u64,
            "Starting live capture"
        );

        loop {
            if !polling {
                poll = None;
                if run.is_idle() {
                    break;
                }
            }

            tokio::select! {
                biased;

                _ = token.cancelled(), if !cancelled => {
                    info!("Live capture stopped, waiting for in-flight segments");
                    cancelled = true;
                    polling = false;
                    run.halt();
                }

                Some(outcome) = run.next_outcome() => {
                    run.handle_outcome(outcome);
                    run.dispatch();
                    if run.is_halted() {
                        polling = false;
                    }
                }

                _ = sleep_until(next_poll), if polling && poll.is_none() => {
                    poll = Some(Box::pin(self.poll(&token)));
                }

                result = poll_in_flight(&mut poll), if poll.is_some() => {
                    poll = None;
                    match result {
                        Ok(media) => {
                            let ended = media.ended;
                            let latest = media.latest_sequence();
                            let scheduled = self.schedule_new(&mut run, &mut tracker, media);
                            trace!(?latest, scheduled, ended, "Polled live playlist");
                            if scheduled > 0 {
                                debug!(scheduled, attempted = run.state().attempted.len(), "Scheduled new segments");
                            }
                            run.dispatch();
                            if ended {
                                info!("Stream ended, draining remaining segments");
                                polling = false;
                            } else {
                                next_poll = Instant::now() + self.live.refresh_interval;
                            }
                        }
                        Err(DownloadError::Cancelled) => {
                            cancelled = true;
                            polling = false;
                            run.halt();
                        }
                        Err(e) => {
                            error!(url = %self.playlist_url, error = %e, "Live playlist poll failed");
                            poll_error = Some(DownloadError::PollFailed {
                                url: self.playlist_url.to_string(),
                                reason: e.to_string(),
                            });
                            polling = false;
                            run.halt();
                        }
                    }
                }

                else => break,
            }
        }

        let state = run.state();
        info!(
            completed = state.completed.len(),
            failed = state.failed.len(),
            bytes = state.bytes_written,
            cancelled,
            "Live capture finished"
        );

        // A segment abort takes precedence over the poll failure it may have caused
        let report = run.finish(cancelled)?;
        match poll_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::FailurePolicy;
    use crate::engine::test_support::*;
    use crate::manifest::fixtures::media_playlist;
    use crate::manifest::parse_manifest;
    use crate::transport::mock::MockTransport;

    const BASE: &str = "https://cdn.example.com/live";

    fn playlist_url() -> String {
        format!("{BASE}/index.m3u8")
    }

    fn serve_segments(transport: &MockTransport, sequences: impl IntoIterator<Item = u64>) {
        for seq in sequences {
            transport.serve(&segment_url(BASE, seq), segment_body(seq));
        }
    }

    fn downloader(
        transport: Arc<MockTransport>,
        dir: &TempDir,
        live: LiveConfig,
    ) -> LiveSegmentDownloader {
        downloader_with(transport, dir, EngineConfig::default(), live)
    }

    fn downloader_with(
        transport: Arc<MockTransport>,
        dir: &TempDir,
        config: EngineConfig,
        live: LiveConfig,
    ) -> LiveSegmentDownloader {
        LiveSegmentDownloader::new(
            transport,
            Url::parse(&playlist_url()).unwrap(),
            dir.path(),
            config,
            live,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn follows_live_edge_from_offset() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.push_response(&playlist_url(), media_playlist(10, 12, false));
        transport.push_response(&playlist_url(), media_playlist(10, 14, false));
        transport.serve(&playlist_url(), media_playlist(10, 14, true));
        serve_segments(&transport, 10..=14);

        let live = LiveConfig {
            from_end: 2,
            ..Default::default()
        };
        let report = downloader(Arc::clone(&transport), &dir, live)
            .start(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written_segments(dir.path()), expected_names(11..=14));
        assert_eq!(report.completed, (11..=14).collect::<BTreeSet<u64>>());
        assert_eq!(transport.request_count(&segment_url(BASE, 10)), 0);
        assert_eq!(transport.request_count(&playlist_url()), 3);
        assert!(!report.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_polls_do_not_duplicate_segments() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.push_response(&playlist_url(), media_playlist(0, 3, false));
        transport.push_response(&playlist_url(), media_playlist(2, 5, false));
        transport.push_response(&playlist_url(), media_playlist(2, 5, false));
        transport.serve(&playlist_url(), media_playlist(4, 7, true));
        serve_segments(&transport, 0..=7);

        let report = downloader(Arc::clone(&transport), &dir, LiveConfig::default())
            .start(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempted.len(), 8);
        assert_eq!(written_segments(dir.path()), expected_names(0..=7));
        for seq in 0..=7 {
            assert_eq!(transport.request_count(&segment_url(BASE, seq)), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_first_poll_keeps_waiting() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.push_response(&playlist_url(), "#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
        transport.serve(&playlist_url(), media_playlist(0, 1, true));
        serve_segments(&transport, 0..=1);

        let report = downloader(Arc::clone(&transport), &dir, LiveConfig::default())
            .start(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.completed, (0..=1).collect::<BTreeSet<u64>>());
        assert_eq!(transport.request_count(&playlist_url()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_partial_report() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.serve(&playlist_url(), media_playlist(0, 1, false));
        serve_segments(&transport, 0..=1);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let report = downloader(Arc::clone(&transport), &dir, LiveConfig::default())
            .start(token)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.completed, (0..=1).collect::<BTreeSet<u64>>());
        // Polls at 0s, 2s and 4s
        assert_eq!(transport.request_count(&playlist_url()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_lets_started_segment_finish() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::with_latency(Duration::from_millis(100)));
        transport.serve(&playlist_url(), media_playlist(0, 0, false));
        serve_segments(&transport, [0]);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            // Poll answers at 100ms, segment 0 is in flight until 200ms
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel();
        });

        let report = downloader(Arc::clone(&transport), &dir, LiveConfig::default())
            .start(token)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.completed, BTreeSet::from([0]));
        assert!(report.failed.is_empty());
        assert_eq!(written_segments(dir.path()), expected_names([0]));
        assert_eq!(transport.request_count(&playlist_url()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_policy_stops_polling() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.serve(&playlist_url(), media_playlist(0, 3, false));
        // Segment 1 is never served: a permanent 404
        serve_segments(&transport, [0, 2, 3]);

        let config = EngineConfig {
            failure_policy: FailurePolicy::Abort,
            ..Default::default()
        };
        let err = downloader_with(Arc::clone(&transport), &dir, config, LiveConfig::default())
            .start(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::SegmentFetchFailed { sequence: 1, .. }
        ));
        assert_eq!(written_segments(dir.path()), expected_names([0]));
        assert_eq!(transport.request_count(&segment_url(BASE, 2)), 0);
        assert_eq!(transport.request_count(&playlist_url()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_workers_follow_live_edge() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::with_latency(Duration::from_millis(50)));
        transport.push_response(&playlist_url(), media_playlist(10, 13, false));
        transport.push_response(&playlist_url(), media_playlist(12, 17, false));
        transport.serve(&playlist_url(), media_playlist(14, 19, true));
        serve_segments(&transport, 10..=19);

        let config = EngineConfig {
            concurrency: 3,
            ..Default::default()
        };
        let report = downloader_with(Arc::clone(&transport), &dir, config, LiveConfig::default())
            .start(CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.completed, (10..=19).collect::<BTreeSet<u64>>());
        assert_eq!(written_segments(dir.path()), expected_names(10..=19));
        for seq in 10..=19 {
            assert_eq!(transport.request_count(&segment_url(BASE, seq)), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn segments_keep_flowing_during_refresh() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::with_latency(Duration::from_millis(100)));
        transport.push_response(&playlist_url(), media_playlist(0, 3, false));
        transport.serve(&playlist_url(), media_playlist(0, 3, true));
        serve_segments(&transport, 0..=3);

        let live = LiveConfig {
            refresh_interval: Duration::from_millis(150),
            ..Default::default()
        };
        let started = Instant::now();
        let report = downloader(Arc::clone(&transport), &dir, live)
            .start(CancellationToken::new())
            .await
            .unwrap();

        // First poll answers at 100ms, then four back-to-back 100ms segments.
        // The refresh at 250ms overlaps segment 1 instead of delaying segment 2.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(550), "{elapsed:?}");
        assert_eq!(report.completed, (0..=3).collect::<BTreeSet<u64>>());
        assert_eq!(transport.request_count(&playlist_url()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_poll_fails_after_draining() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.push_response(&playlist_url(), media_playlist(0, 1, false));
        serve_segments(&transport, 0..=1);

        let err = downloader(Arc::clone(&transport), &dir, LiveConfig::default())
            .start(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::PollFailed { .. }));
        assert_eq!(written_segments(dir.path()), expected_names(0..=1));
    }

    #[test]
    fn floor_counts_back_from_live_edge() {
        let media = parse_manifest(media_playlist(10, 12, false).as_bytes())
            .unwrap()
            .into_media()
            .unwrap();
        let mut tracker = EdgeTracker::default();
        assert_eq!(tracker.floor(&media, 2), Some(11));
        assert_eq!(tracker.floor(&media, 9999), Some(0));
        tracker.observe(&media);
        assert_eq!(tracker.floor(&media, 2), Some(13));
    }
}
