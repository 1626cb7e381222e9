//! Gateway configuration.
//!
//! Tunables come from CLI flags (see `ServeArgs`); the upstream endpoint
//! list and credentials come from the environment (a `.env` file is loaded
//! at startup):
//!
//! - `BIOBRIDGE_ENDPOINTS` - comma separated upstream base URLs, tried in order
//! - `BIOBRIDGE_LOGIN_ID`
//! - `BIOBRIDGE_PASSWORD`

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;

pub const DEFAULT_DEVICE_ADDR: &str = "0.0.0.0:51212";
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:51213";
pub const DEFAULT_CAPTURE_QUALITY: u8 = 80;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),

    #[error("no upstream endpoints configured")]
    NoEndpoints,

    #[error("invalid upstream endpoint '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },
}

/// Login credentials for the upstream service.
#[derive(Clone)]
pub struct Credentials {
    pub login_id: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login_id: login_id.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login_id", &self.login_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session manager settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Candidate base URLs, in priority order.
    pub endpoints: Vec<Url>,
    pub credentials: Credentials,
    /// A session older than this is treated as expired without asking upstream.
    pub ttl: Duration,
    /// Delay before a background retry after every endpoint failed.
    pub backoff: Duration,
    /// Consecutive background retries before giving up until the next acquire.
    pub max_background_retries: u32,
    /// Upper bound on one login request against one endpoint.
    pub login_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoints: Vec<Url>, credentials: Credentials) -> Self {
        Self {
            endpoints,
            credentials,
            ttl: Duration::from_secs(30 * 60),
            backoff: Duration::from_secs(5),
            max_background_retries: 5,
            login_timeout: Duration::from_secs(10),
        }
    }

    /// Load endpoints and credentials from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load endpoints and credentials through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup("BIOBRIDGE_ENDPOINTS").ok_or(ConfigError::MissingVar("BIOBRIDGE_ENDPOINTS"))?;
        let endpoints = parse_endpoints(&raw)?;

        let login_id = lookup("BIOBRIDGE_LOGIN_ID").ok_or(ConfigError::MissingVar("BIOBRIDGE_LOGIN_ID"))?;
        let password = lookup("BIOBRIDGE_PASSWORD").ok_or(ConfigError::MissingVar("BIOBRIDGE_PASSWORD"))?;

        Ok(Self::new(endpoints, Credentials::new(login_id, password)))
    }
}

/// Full gateway configuration.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Device listener.
    pub listen_addr: SocketAddr,
    /// Control API listener. `None` disables it.
    pub control_addr: Option<SocketAddr>,
    /// Upper bound on every upstream call.
    pub request_timeout: Duration,
    /// Default capture quality threshold.
    pub capture_quality: u8,
    /// Largest accepted frame payload.
    pub max_payload: usize,
    /// Close device connections silent for this long.
    pub idle_timeout: Duration,
    pub session: SessionConfig,
}

impl GatewayConfig {
    pub fn new(listen_addr: SocketAddr, session: SessionConfig) -> Self {
        Self {
            listen_addr,
            control_addr: None,
            request_timeout: Duration::from_secs(10),
            capture_quality: DEFAULT_CAPTURE_QUALITY,
            max_payload: biobridge_core::frame::DEFAULT_MAX_PAYLOAD,
            idle_timeout: Duration::from_secs(5 * 60),
            session,
        }
    }
}

/// Flags accepted by `biobridge serve`.
#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Device listener address
    #[arg(long, default_value = DEFAULT_DEVICE_ADDR)]
    pub listen: String,

    /// Control API address
    #[arg(long, default_value = DEFAULT_CONTROL_ADDR)]
    pub control: String,

    /// Disable the control API listener
    #[arg(long)]
    pub no_control: bool,

    /// Upstream request timeout (e.g. "10s", "500ms")
    #[arg(long, default_value = "10s")]
    pub request_timeout: String,

    /// Delay before retrying login after every endpoint failed
    #[arg(long, default_value = "5s")]
    pub login_backoff: String,

    /// Upstream session lifetime before a forced re-login
    #[arg(long, default_value = "30m")]
    pub session_ttl: String,

    /// Consecutive background login retries
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    /// Capture quality threshold (0-100)
    #[arg(long, default_value_t = DEFAULT_CAPTURE_QUALITY)]
    pub quality: u8,

    /// Largest accepted frame payload in bytes
    #[arg(long, default_value_t = biobridge_core::frame::DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,

    /// Close device connections idle for this long
    #[arg(long, default_value = "5m")]
    pub idle_timeout: String,

    /// SQLite database path (defaults to the local data directory)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Log records instead of storing them
    #[arg(long)]
    pub no_persist: bool,
}

impl ServeArgs {
    /// Flag defaults, for `biobridge` run without a subcommand.
    pub fn parse_default() -> Self {
        #[derive(clap::Parser)]
        struct Defaults {
            #[command(flatten)]
            args: ServeArgs,
        }

        <Defaults as clap::Parser>::parse_from(["biobridge"]).args
    }

    /// Combine flags with the environment-provided session settings.
    pub fn into_config(self, mut session: SessionConfig) -> Result<GatewayConfig, ConfigError> {
        session.ttl = parse_duration(&self.session_ttl)?;
        session.backoff = parse_duration(&self.login_backoff)?;
        session.max_background_retries = self.max_retries;

        let mut config = GatewayConfig::new(parse_addr(&self.listen)?, session);
        config.control_addr = if self.no_control {
            None
        } else {
            Some(parse_addr(&self.control)?)
        };
        config.request_timeout = parse_duration(&self.request_timeout)?;
        config.session.login_timeout = config.request_timeout;
        config.capture_quality = self.quality.min(100);
        config.max_payload = self.max_payload.min(u16::MAX as usize);
        config.idle_timeout = parse_duration(&self.idle_timeout)?;
        Ok(config)
    }

    /// Database location: `--db`, else `<data dir>/biobridge/records.db`.
    pub fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(default_db_path)
    }
}

pub fn default_db_path() -> PathBuf {
    data_dir().join("records.db")
}

/// Local data directory for the gateway.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("biobridge")
}

pub fn parse_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    s.trim().parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddress {
        value: s.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a comma separated endpoint list, keeping order.
pub fn parse_endpoints(raw: &str) -> Result<Vec<Url>, ConfigError> {
    let mut endpoints = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let url = Url::parse(part).map_err(|e| ConfigError::InvalidEndpoint {
            value: part.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint {
                value: part.to_string(),
                reason: "scheme must be http or https".to_string(),
            });
        }
        endpoints.push(url);
    }

    if endpoints.is_empty() {
        return Err(ConfigError::NoEndpoints);
    }
    Ok(endpoints)
}

/// Parse a duration string like "500ms", "10s", "5m" or "1h".
///
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    let (num_str, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1_000)
    };

    let num: u64 = num_str.trim().parse().map_err(|_| invalid())?;
    let ms = num.checked_mul(unit_ms).ok_or_else(invalid)?;
    if ms == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_millis(ms))
}
