// Bounded segment worker pool: a FIFO of pending jobs and at most `concurrency` fetch tasks.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use indicatif::ProgressStyle;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info_span, trace};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use url::Url;

use crate::error::DownloadError;
use crate::manifest::Segment;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::transport::Transport;

/// A segment waiting for, or going through, download.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub segment: Segment,
    /// Absolute segment URL
    pub url: Url,
    pub destination: PathBuf,
    /// Attempts made so far
    pub attempt: u32,
}

impl DownloadJob {
    pub fn new(segment: Segment, url: Url, destination: PathBuf) -> Self {
        Self {
            segment,
            url,
            destination,
            attempt: 0,
        }
    }

    pub fn sequence_number(&self) -> u64 {
        self.segment.sequence_number
    }
}

/// Terminal result of one job, reported back to the scheduling loop.
#[derive(Debug)]
pub struct JobOutcome {
    pub sequence_number: u64,
    pub attempts: u32,
    /// Bytes written on success
    pub result: Result<u64, DownloadError>,
}

pub(crate) struct SegmentPool {
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
    concurrency: usize,
    /// Hard shutdown for running jobs. Never the run's cancellation token.
    token: CancellationToken,
    pending: VecDeque<DownloadJob>,
    in_flight: JoinSet<JobOutcome>,
    /// Task id -> sequence number, to attribute panicked tasks
    task_sequences: HashMap<Id, u64>,
}

impl SegmentPool {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        retry_policy: RetryPolicy,
        concurrency: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            retry_policy,
            concurrency: concurrency.max(1),
            token,
            pending: VecDeque::new(),
            in_flight: JoinSet::new(),
            task_sequences: HashMap::new(),
        }
    }

    pub(crate) fn enqueue(&mut self, job: DownloadJob) {
        self.pending.push_back(job);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Start pending jobs until the concurrency limit is reached. Returns how many started.
    pub(crate) fn dispatch(&mut self) -> usize {
        let mut started = 0;
        while self.in_flight.len() < self.concurrency {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            let sequence = job.sequence_number();
            let span = info_span!("segment", msn = sequence);
            let task = fetch_job(
                Arc::clone(&self.transport),
                self.retry_policy.clone(),
                self.token.clone(),
                job,
            )
            .instrument(span);
            let handle = self.in_flight.spawn(task);
            self.task_sequences.insert(handle.id(), sequence);
            trace!(msn = sequence, in_flight = self.in_flight.len(), "Segment job dispatched");
            started += 1;
        }
        started
    }

    /// Drop every job that has not started yet. Returns how many were dropped.
    pub(crate) fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Wait for the next in-flight job to finish. `None` when nothing is in flight.
    pub(crate) async fn next_outcome(&mut self) -> Option<JobOutcome> {
        let joined = self.in_flight.join_next_with_id().await?;
        let outcome = match joined {
            Ok((id, outcome)) => {
                self.task_sequences.remove(&id);
                outcome
            }
            Err(join_error) => {
                let sequence = self
                    .task_sequences
                    .remove(&join_error.id())
                    .unwrap_or_default();
                error!(msn = sequence, error = %join_error, "Segment task did not complete");
                JobOutcome {
                    sequence_number: sequence,
                    attempts: 0,
                    result: Err(DownloadError::Internal {
                        reason: format!("segment task failed: {join_error}"),
                    }),
                }
            }
        };
        Some(outcome)
    }
}

fn progress_style() -> Option<ProgressStyle> {
    ProgressStyle::default_bar()
        .template("{span_child_prefix}{spinner:.yellow} {msg} {bytes}")
        .ok()
}

/// Fetch one segment with retries and write it to its destination.
async fn fetch_job(
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
    token: CancellationToken,
    mut job: DownloadJob,
) -> JobOutcome {
    let sequence_number = job.sequence_number();
    let label = format!("Segment #{sequence_number}");
    let span = Span::current();
    if let Some(style) = progress_style() {
        span.pb_set_style(&style);
    }
    span.pb_set_message(&label);

    let attempts = AtomicU32::new(0);
    let fetched = retry_with_backoff(&retry_policy, &token, |_| {
        attempts.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::clone(&transport);
        let url = job.url.clone();
        let token = token.clone();
        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => RetryAction::Fail(DownloadError::Cancelled),
                result = transport.fetch(&url) => RetryAction::classify(result),
            }
        }
    })
    .await;
    job.attempt = attempts.load(Ordering::Relaxed);

    let result = match fetched {
        Ok(bytes) => {
            span.pb_set_length(bytes.len() as u64);
            span.pb_set_position(bytes.len() as u64);
            write_segment(&job, &bytes).await.map(|_| bytes.len() as u64)
        }
        Err(e) => Err(e),
    };

    match &result {
        Ok(size) => {
            debug!(msn = sequence_number, size, attempts = job.attempt, "Downloaded segment");
            span.pb_set_finish_message(&label);
        }
        Err(e) => span.pb_set_finish_message(&format!("{label} failed: {e}")),
    }

    JobOutcome {
        sequence_number,
        attempts: job.attempt,
        result,
    }
}

/// Write through a `.part` file so a partially written segment never looks complete.
async fn write_segment(job: &DownloadJob, bytes: &[u8]) -> Result<(), DownloadError> {
    let partial = job.destination.with_extension("part");
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, &job.destination).await?;
    Ok(())
}
