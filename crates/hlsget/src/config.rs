use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Number of segments back from the live edge used when no `from_end` is given.
/// Large enough to mean "everything the playlist currently lists".
pub const DEFAULT_FROM_END: u64 = 9999;

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080" or "socks5://127.0.0.1:1080")
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// HTTP options shared by every playlist and segment request.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a single request (zero disables it)
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers forwarded with every fetch. Merged over [`HttpConfig::get_default_headers`].
    pub headers: HeaderMap,

    /// Explicit proxy, takes precedence over the system proxy
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if no explicit proxy is set
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
        }
    }
}

impl HttpConfig {
    /// Returns a copy whose headers are the defaults overlaid with `custom`.
    /// Custom headers take precedence over defaults for the same fields.
    pub fn with_headers(mut self, custom: HeaderMap) -> Self {
        let mut headers = HttpConfig::get_default_headers();
        for (name, value) in custom.iter() {
            headers.insert(name.clone(), value.clone());
        }
        self.headers = headers;
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        default_headers
    }
}

/// What to do with a segment that exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum FailurePolicy {
    /// Report the segment as failed and keep downloading the others
    #[default]
    Skip,
    /// Stop dispatching, drain in-flight downloads and fail the run
    Abort,
}

/// Settings shared by the static and the live segment downloaders.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max concurrent segment downloads (default: 1, values below 1 are treated as 1)
    pub concurrency: usize,
    /// Retries after the first attempt, for segments and playlist fetches (default: 1)
    pub max_retries: u32,
    /// Base delay between attempts. Zero retries immediately.
    pub retry_delay: Duration,
    /// Hard cap for the exponential retry delay
    pub max_retry_delay: Duration,
    /// Add random jitter to non-zero retry delays
    pub retry_jitter: bool,
    pub failure_policy: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retries: 1,
            retry_delay: Duration::ZERO,
            max_retry_delay: Duration::from_secs(10),
            retry_jitter: false,
            failure_policy: FailurePolicy::Skip,
        }
    }
}

impl EngineConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
            jitter: self.retry_jitter,
        }
    }
}

/// Live-only settings.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// How many segments back from the live edge the first poll starts at
    pub from_end: u64,
    /// Fixed delay between two playlist polls
    pub refresh_interval: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            from_end: DEFAULT_FROM_END,
            refresh_interval: Duration::from_secs(2),
        }
    }
}
