use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hlsget_engine::{
    EngineConfig, FailurePolicy, GrabConfig, HttpConfig, LiveConfig, MergeStrategy, ProxyConfig,
    Quality, RunId, config::DEFAULT_FROM_END,
};

use crate::error::{AppError, Result};
use crate::headers::parse_headers;

#[derive(Parser, Debug)]
#[command(
    name = "hlsget",
    author,
    version,
    about = "Download an HLS stream (VOD or live) into a single media file",
    long_about = None
)]
pub struct Args {
    /// Master or media playlist URL
    #[arg(required = true)]
    pub url: String,

    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Variant to download from a master playlist: `best`, `worst` or a bandwidth in bit/s
    #[arg(short, long)]
    pub quality: Option<Quality>,

    /// Follow the playlist as a live stream until it ends or `q`/Ctrl-C is pressed
    #[arg(long)]
    pub live: bool,

    /// Maximum number of concurrent segment downloads
    #[arg(short = 'c', long, default_value = "1")]
    pub concurrency: usize,

    /// Retries after the first attempt, for segments and playlists
    #[arg(long, default_value = "1")]
    pub max_retries: u32,

    /// Base delay between retries in milliseconds (0 retries immediately)
    #[arg(long, default_value = "0")]
    pub retry_delay_ms: u64,

    /// What to do when a segment exhausts its retries
    #[arg(long, value_enum, default_value = "skip")]
    pub on_segment_error: FailurePolicy,

    /// Live: segments back from the live edge to start at
    #[arg(long, default_value_t = DEFAULT_FROM_END)]
    pub from_end: u64,

    /// Live: delay between playlist refreshes in milliseconds
    #[arg(long, default_value = "2000")]
    pub refresh_interval_ms: u64,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Override the User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Overall request timeout in seconds (0 = no timeout)
    #[arg(long, default_value = "0")]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(long, default_value = "30")]
    pub connect_timeout: u64,

    /// Proxy URL (http, https or socks5)
    #[arg(long)]
    pub proxy: Option<String>,

    #[arg(long, requires = "proxy")]
    pub proxy_username: Option<String>,

    #[arg(long, requires = "proxy")]
    pub proxy_password: Option<String>,

    /// Ignore system proxy settings
    #[arg(long)]
    pub no_system_proxy: bool,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Directory for downloaded segments (default: a run-scoped temp directory)
    #[arg(long)]
    pub segments_dir: Option<PathBuf>,

    /// Intermediate merged file (default: a run-scoped temp file)
    #[arg(long)]
    pub merged_file: Option<PathBuf>,

    /// How segments are merged before transmuxing
    #[arg(long, value_enum, default_value = "concat")]
    pub merge: MergeStrategy,

    /// ffmpeg binary
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Write the merged MPEG-TS as-is instead of transmuxing with ffmpeg
    #[arg(long)]
    pub no_transmux: bool,

    /// Keep segments and the merged file after a successful run
    #[arg(long)]
    pub keep_segments: bool,

    /// Identifier used to name temporary files
    #[arg(long)]
    pub run_id: Option<String>,

    /// Disable the `q` key listener
    #[arg(long)]
    pub no_input: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    pub fn to_config(&self) -> Result<GrabConfig> {
        let mut config = GrabConfig::new(self.url.clone(), self.output.clone());
        config.quality = self.quality;
        config.live = self.live;
        config.engine = self.engine_config()?;
        config.live_config = LiveConfig {
            from_end: self.from_end,
            refresh_interval: Duration::from_millis(self.refresh_interval_ms),
        };
        config.http = self.http_config()?;
        config.segments_dir = self.segments_dir.clone();
        config.merged_file = self.merged_file.clone();
        config.merge_strategy = self.merge;
        config.ffmpeg_path = self.ffmpeg.clone();
        config.transmux = !self.no_transmux;
        config.keep_segments = self.keep_segments;
        if let Some(run_id) = &self.run_id {
            config.run_id = RunId::new(run_id.clone());
        }
        Ok(config)
    }

    fn engine_config(&self) -> Result<EngineConfig> {
        if self.concurrency == 0 {
            return Err(AppError::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(EngineConfig {
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            retry_jitter: self.retry_delay_ms > 0,
            failure_policy: self.on_segment_error,
            ..Default::default()
        })
    }

    fn http_config(&self) -> Result<HttpConfig> {
        let mut http = HttpConfig {
            timeout: Duration::from_secs(self.timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            use_system_proxy: !self.no_system_proxy,
            danger_accept_invalid_certs: self.insecure,
            proxy: self.proxy.as_ref().map(|url| ProxyConfig {
                url: url.clone(),
                username: self.proxy_username.clone(),
                password: self.proxy_password.clone(),
            }),
            ..Default::default()
        };
        if let Some(user_agent) = &self.user_agent {
            http.user_agent = user_agent.clone();
        }
        Ok(http.with_headers(parse_headers(&self.headers)?))
    }
}
