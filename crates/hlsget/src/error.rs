use reqwest::StatusCode;

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("manifest unreachable at {url}: {reason}")]
    ManifestUnreachable { url: String, reason: String },

    #[error("no segments or variants found in {url}")]
    NoContentFound { url: String },

    #[error("master playlist {url} lists {variants} variants, a quality must be provided")]
    MissingQuality { url: String, variants: usize },

    #[error("segment #{sequence} failed after {attempts} attempt(s): {reason}")]
    SegmentFetchFailed {
        sequence: u64,
        attempts: u32,
        reason: String,
    },

    #[error("live playlist {url} could not be refreshed: {reason}")]
    PollFailed { url: String, reason: String },

    #[error("manifest not loaded, call load() first")]
    NotLoaded,

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("playlist parse error: {reason}")]
    Parse { reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("ffmpeg failed: {reason}")]
    Ffmpeg { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether a failed attempt is worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::Parse { .. } | Self::Io { .. } => true,
            Self::Cancelled
            | Self::ManifestUnreachable { .. }
            | Self::NoContentFound { .. }
            | Self::MissingQuality { .. }
            | Self::SegmentFetchFailed { .. }
            | Self::PollFailed { .. }
            | Self::NotLoaded
            | Self::InvalidUrl { .. }
            | Self::Ffmpeg { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Aborts that happen before any segment is scheduled.
    pub fn is_selection_error(&self) -> bool {
        matches!(
            self,
            Self::NoContentFound { .. } | Self::MissingQuality { .. }
        )
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = DownloadError::http_status(StatusCode::SERVICE_UNAVAILABLE, "https://a/b.ts");
        assert!(err.is_retryable());
        let err = DownloadError::http_status(StatusCode::TOO_MANY_REQUESTS, "https://a/b.ts");
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = DownloadError::http_status(StatusCode::NOT_FOUND, "https://a/b.ts");
        assert!(!err.is_retryable());
        assert!(!DownloadError::invalid_url("::", "relative URL without a base").is_retryable());
    }

    #[test]
    fn selection_errors_are_flagged() {
        assert!(
            DownloadError::MissingQuality {
                url: "https://a/master.m3u8".to_string(),
                variants: 2,
            }
            .is_selection_error()
        );
        assert!(!DownloadError::Cancelled.is_selection_error());
    }
}
