//! Segment acquisition engines.
//!
//! Both downloaders share the same shape: a single `tokio::select!` loop owns a
//! [`DownloadState`] and a bounded worker pool. Workers only report a
//! [`JobOutcome`]; the loop is the only place state changes.

mod live_downloader;
mod pool;
mod static_downloader;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use url::Url;

use crate::config::{EngineConfig, FailurePolicy};
use crate::error::{DownloadError, Result};
use crate::manifest::{Manifest, Segment, parse_manifest};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::transport::Transport;

pub use live_downloader::LiveSegmentDownloader;
pub use pool::{DownloadJob, JobOutcome};
pub use static_downloader::StaticSegmentDownloader;

use pool::SegmentPool;

/// Turns a media playlist URL into segment files on disk.
#[async_trait]
pub trait SegmentDownloadEngine: Send {
    /// Run to completion. Returns only once every scheduled job is terminal.
    async fn start(&mut self, token: CancellationToken) -> Result<DownloadReport>;
}

/// File name of a segment. Zero padded so that lexicographic order is publication order.
pub fn segment_file_name(sequence_number: u64) -> String {
    format!("{sequence_number:020}.ts")
}

/// A segment that exhausted its retries or failed permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFailure {
    pub sequence_number: u64,
    pub attempts: u32,
    pub reason: String,
}

/// Bookkeeping for one `start()` call.
#[derive(Debug, Clone, Default)]
pub struct DownloadState {
    /// Every sequence number ever scheduled
    pub attempted: BTreeSet<u64>,
    pub completed: BTreeSet<u64>,
    pub failed: Vec<SegmentFailure>,
    /// Retries used per sequence number (attempts beyond the first)
    pub retries: BTreeMap<u64, u32>,
    pub in_flight: usize,
    pub bytes_written: u64,
}

/// What a finished run produced.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub attempted: BTreeSet<u64>,
    pub completed: BTreeSet<u64>,
    pub failed: Vec<SegmentFailure>,
    pub retries: BTreeMap<u64, u32>,
    pub bytes_written: u64,
    /// The run was stopped through its cancellation token
    pub cancelled: bool,
}

impl DownloadReport {
    pub fn total_retries(&self) -> u32 {
        self.retries.values().sum()
    }

    /// Every scheduled segment was written.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.completed.len() == self.attempted.len()
    }
}

impl From<DownloadState> for DownloadReport {
    fn from(state: DownloadState) -> Self {
        Self {
            attempted: state.attempted,
            completed: state.completed,
            failed: state.failed,
            retries: state.retries,
            bytes_written: state.bytes_written,
            cancelled: false,
        }
    }
}

/// Fetch and parse a playlist, retrying transient failures.
///
/// The request races the token, so a cancelled run never waits on a slow server.
pub(crate) async fn fetch_manifest(
    transport: &dyn Transport,
    url: &Url,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Manifest> {
    retry_with_backoff(policy, token, |_| async move {
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            result = transport.fetch(url) => result,
        };
        RetryAction::classify(fetched.and_then(|bytes| parse_manifest(&bytes)))
    })
    .await
}

/// State and worker pool driven by one scheduling loop.
pub(crate) struct SegmentRun {
    pool: SegmentPool,
    state: DownloadState,
    failure_policy: FailurePolicy,
    segments_dir: PathBuf,
    /// No more jobs are dispatched once set
    halted: bool,
    /// First failure seen under [`FailurePolicy::Abort`]
    abort: Option<SegmentFailure>,
    /// Cancels the workers only if the run itself is dropped
    _shutdown: DropGuard,
}

impl SegmentRun {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: &EngineConfig,
        segments_dir: &Path,
    ) -> Self {
        // Workers do not see the run's token: once started, a job finishes
        // (retries included) even after the run is cancelled.
        let shutdown = CancellationToken::new();
        Self {
            pool: SegmentPool::new(
                transport,
                config.retry_policy(),
                config.effective_concurrency(),
                shutdown.clone(),
            ),
            state: DownloadState::default(),
            failure_policy: config.failure_policy,
            segments_dir: segments_dir.to_path_buf(),
            halted: false,
            abort: None,
            _shutdown: shutdown.drop_guard(),
        }
    }

    pub(crate) fn state(&self) -> &DownloadState {
        &self.state
    }

    /// Queue a segment unless its sequence number was already scheduled.
    pub(crate) fn schedule(&mut self, playlist_url: &Url, segment: Segment) -> bool {
        let sequence = segment.sequence_number;
        if self.halted || !self.state.attempted.insert(sequence) {
            return false;
        }

        match playlist_url.join(&segment.uri) {
            Ok(url) => {
                let destination = self.segments_dir.join(segment_file_name(sequence));
                self.pool.enqueue(DownloadJob::new(segment, url, destination));
            }
            Err(e) => {
                let err = DownloadError::invalid_url(&segment.uri, e);
                self.record_failure(sequence, 0, &err);
            }
        }
        true
    }

    pub(crate) fn dispatch(&mut self) {
        if !self.halted {
            self.pool.dispatch();
        }
        self.state.in_flight = self.pool.in_flight();
    }

    /// Stop dispatching. Jobs already running are left to drain.
    pub(crate) fn halt(&mut self) {
        self.halted = true;
        let dropped = self.pool.clear_pending();
        if dropped > 0 {
            debug!(dropped, "Dropped pending segment jobs");
        }
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pool.is_idle()
    }

    pub(crate) async fn next_outcome(&mut self) -> Option<JobOutcome> {
        self.pool.next_outcome().await
    }

    pub(crate) fn handle_outcome(&mut self, outcome: JobOutcome) {
        let JobOutcome {
            sequence_number,
            attempts,
            result,
        } = outcome;

        if attempts > 1 {
            self.state.retries.insert(sequence_number, attempts - 1);
        }

        match result {
            Ok(bytes) => {
                self.state.completed.insert(sequence_number);
                self.state.bytes_written += bytes;
            }
            // Only reachable when the run is torn down mid-flight
            Err(DownloadError::Cancelled) => {
                debug!(msn = sequence_number, "Segment download interrupted");
            }
            Err(e) => self.record_failure(sequence_number, attempts, &e),
        }
        self.state.in_flight = self.pool.in_flight();
    }

    fn record_failure(&mut self, sequence_number: u64, attempts: u32, error: &DownloadError) {
        warn!(msn = sequence_number, attempts, error = %error, "Segment download failed");
        let failure = SegmentFailure {
            sequence_number,
            attempts,
            reason: error.to_string(),
        };
        if self.failure_policy == FailurePolicy::Abort && self.abort.is_none() {
            self.abort = Some(failure.clone());
            self.halt();
        }
        self.state.failed.push(failure);
    }

    /// Turn the final state into the run result.
    pub(crate) fn finish(self, cancelled: bool) -> Result<DownloadReport> {
        if let Some(failure) = self.abort {
            return Err(DownloadError::SegmentFetchFailed {
                sequence: failure.sequence_number,
                attempts: failure.attempts,
                reason: failure.reason,
            });
        }
        let mut report = DownloadReport::from(self.state);
        report.cancelled = cancelled;
        Ok(report)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::fixtures::media_playlist;
    use crate::transport::mock::MockTransport;
    use reqwest::StatusCode;

    #[test]
    fn segment_names_sort_in_sequence_order() {
        let mut names: Vec<String> = [10u64, 9, 100, 2].into_iter().map(segment_file_name).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                segment_file_name(2),
                segment_file_name(9),
                segment_file_name(10),
                segment_file_name(100)
            ]
        );
        assert_eq!(segment_file_name(7), "00000000000000000007.ts");
    }

    #[tokio::test]
    async fn fetch_manifest_retries_transient_failure() {
        let transport = MockTransport::new();
        let url = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();
        transport.push_failure(url.as_str(), StatusCode::SERVICE_UNAVAILABLE);
        transport.serve(url.as_str(), media_playlist(0, 1, false));

        let manifest = fetch_manifest(
            &transport,
            &url,
            &RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(manifest.has_content());
        assert_eq!(transport.request_count(url.as_str()), 2);
    }

    #[tokio::test]
    async fn fetch_manifest_gives_up_on_not_found() {
        let transport = MockTransport::new();
        let url = Url::parse("https://cdn.example.com/missing.m3u8").unwrap();
        let err = fetch_manifest(
            &transport,
            &url,
            &RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { .. }));
        assert_eq!(transport.request_count(url.as_str()), 1);
    }

    #[test]
    fn report_counts_retries() {
        let mut state = DownloadState::default();
        state.attempted.extend([1, 2, 3]);
        state.completed.extend([1, 2, 3]);
        state.retries.insert(2, 1);
        state.retries.insert(3, 2);
        let report = DownloadReport::from(state);
        assert_eq!(report.total_retries(), 3);
        assert!(report.is_complete());
        assert!(!report.cancelled);
    }
}
