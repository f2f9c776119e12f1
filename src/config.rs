//! Configuration for the job tracker and its HTTP collaborators.
//!
//! Every knob lives in [`TrackerConfig`], built via its
//! [`TrackerConfigBuilder`]. The CLI maps its flags onto the builder; library
//! users set only what differs from the defaults.

use crate::error::TrackerError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default poll period for a subscribed job.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Configuration for a [`crate::Tracker`].
///
/// # Example
/// ```rust
/// use doc2img_client::TrackerConfig;
/// use std::time::Duration;
///
/// let config = TrackerConfig::builder()
///     .server_url("http://localhost:8000")
///     .poll_interval(Duration::from_secs(5))
///     .dpi(200)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 200);
/// ```
#[derive(Clone)]
pub struct TrackerConfig {
    /// Base URL of the conversion service. Default: `http://localhost:8000`.
    pub server_url: String,

    /// Base URL of the identity provider. Default: `http://localhost:1337`.
    pub identity_url: String,

    /// Period between two status checks of the same job. Default: 3 s.
    ///
    /// A job's cycles are serialized: the next check is not issued until the
    /// previous response was applied or timed out, so a slow response delays
    /// the following cycle instead of overlapping it.
    pub poll_interval: Duration,

    /// Per-request timeout for submit, status and login calls. Default: 30.
    pub request_timeout_secs: u64,

    /// Timeout for archive downloads in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Rendering DPI requested from the service. Range: 72–600. Default: 144.
    pub dpi: u32,

    /// Where to persist the session between runs. `None` keeps it in memory.
    pub session_file: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            identity_url: "http://localhost:1337".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout_secs: 30,
            download_timeout_secs: 120,
            dpi: 144,
            session_file: None,
        }
    }
}

impl fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("server_url", &self.server_url)
            .field("identity_url", &self.identity_url)
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("dpi", &self.dpi)
            .field("session_file", &self.session_file)
            .finish()
    }
}

impl TrackerConfig {
    /// Create a new builder for `TrackerConfig`.
    pub fn builder() -> TrackerConfigBuilder {
        TrackerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Poll request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Builder for [`TrackerConfig`].
#[derive(Debug)]
pub struct TrackerConfigBuilder {
    config: TrackerConfig,
}

impl TrackerConfigBuilder {
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn identity_url(mut self, url: impl Into<String>) -> Self {
        self.config.identity_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn poll_interval(mut self, period: Duration) -> Self {
        self.config.poll_interval = period;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.session_file = Some(path.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<TrackerConfig, TrackerError> {
        let c = &self.config;
        if c.poll_interval.is_zero() {
            return Err(TrackerError::InvalidConfig(
                "Poll interval must be greater than zero".into(),
            ));
        }
        for (name, url) in [("server", &c.server_url), ("identity", &c.identity_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(TrackerError::InvalidConfig(format!(
                    "{name} URL must start with http:// or https://, got '{url}'"
                )));
            }
        }
        Ok(self.config)
    }
}
