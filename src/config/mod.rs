//! Configuration types for the client and the command-line front end.

pub(crate) mod endpoints;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use endpoints::Endpoints;

use crate::error::{Error, Result};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_7_5) AppleWebKit/537.13 (KHTML, like Gecko) Chrome/24.0.1290.1 Safari/537.13";

/// Retry behaviour for requests the remote drops before answering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `delay`, capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.backoff_multiplier).min(self.max_delay)
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first retry delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for a single request, body included.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Retry policy for dropped connections.
    pub retry: RetryPolicy,
    /// How often the poller refreshes in-flight tasks.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Pause after a failed poll before trying again.
    #[serde(with = "millis")]
    pub poll_error_backoff: Duration,
    /// How many times login polls the challenge cookie.
    pub login_check_attempts: u32,
    /// Largest response body accepted.
    pub max_body_bytes: usize,
    /// Tasks per listing page.
    pub page_size: u32,
    /// Sub-files per BT listing page.
    pub bt_page_size: u32,
    /// Page size used when the large BT page comes back truncated.
    pub bt_fallback_page_size: u32,
    pub user_agent: String,
    /// Level used for request and response log lines.
    pub request_log_level: log::Level,
    pub endpoints: Endpoints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(60),
            poll_error_backoff: Duration::from_secs(5),
            login_check_attempts: 10,
            max_body_bytes: 32 * 1024 * 1024,
            page_size: 100,
            bt_page_size: 999,
            bt_fallback_page_size: 100,
            user_agent: USER_AGENT.to_string(),
            request_log_level: log::Level::Debug,
            endpoints: Endpoints::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-request deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the pause after a failed poll.
    #[must_use]
    pub const fn with_poll_error_backoff(mut self, backoff: Duration) -> Self {
        self.poll_error_backoff = backoff;
        self
    }

    /// Sets the listing page size.
    #[must_use]
    pub const fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the maximum accepted body size.
    #[must_use]
    pub const fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Points every remote URL at different hosts.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

/// Path configuration for session state and downloads.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Directory where downloaded files are verified from.
    pub download_dir: PathBuf,
    /// Directory where configuration files are read from.
    pub config_dir: PathBuf,
    /// File holding the saved session cookies.
    pub cookie_file: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let cookie_file = std::env::var_os("LIXIAN_COOKIE_FILE")
            .map_or_else(|| data_dir.join("lixian").join("cookie.json"), PathBuf::from);

        Self {
            download_dir: PathBuf::from("."),
            config_dir: config_dir.join("lixian"),
            cookie_file,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Client configuration.
    pub client: ClientConfig,
    /// Path configuration.
    pub paths: PathConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `config.toml` from the default config directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let paths = PathConfig::default();
        let client = load_client_config(&paths.config_dir.join("config.toml"))?;
        Ok(Self { client, paths })
    }
}

/// Reads a [`ClientConfig`] from a TOML file, falling back to defaults when
/// the file does not exist.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid TOML.
pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
        Err(e) => Err(e.into()),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
