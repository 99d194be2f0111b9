//! wolfdoc Configuration
//!
//! Dial settings for a cluster, loadable from a TOML file or from a
//! `mongodb://` connection URL.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::Credential;
use crate::session::Mode;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfdocConfig {
    /// How to reach the cluster
    pub dial: DialInfo,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster dial settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialInfo {
    /// Seed addresses (`host` or `host:port`)
    pub addrs: Vec<String>,

    /// Talk only to the seeds, never to discovered peers
    #[serde(default)]
    pub direct: bool,

    /// Give up after one sync round instead of waiting for the timeout
    #[serde(default)]
    pub fail_fast: bool,

    /// Required replica set name
    #[serde(default)]
    pub replica_set_name: Option<String>,

    /// How long to wait for a suitable server (0 waits forever)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Per-request socket timeout (0 disables it)
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Sockets per server (0 = unlimited)
    #[serde(default = "default_pool_limit")]
    pub pool_limit: usize,

    /// Default database
    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub credential: Option<Credential>,

    /// Session mode after dialing
    #[serde(default)]
    pub mode: Mode,

    /// Topology sync timing
    #[serde(default)]
    pub tuning: SyncTuning,
}

/// Timing of the topology sync loop and the server pingers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTuning {
    /// Pause between forced sync rounds
    #[serde(default = "default_sync_short_delay_ms")]
    pub sync_short_delay_ms: u64,

    /// Idle time between regular sync rounds
    #[serde(default = "default_sync_servers_delay_ms")]
    pub sync_servers_delay_ms: u64,

    /// Timeout for handshake sockets
    #[serde(default = "default_sync_socket_timeout_ms")]
    pub sync_socket_timeout_ms: u64,

    #[serde(default = "default_ping_delay_ms")]
    pub ping_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_socket_timeout_ms() -> u64 {
    60_000
}

fn default_pool_limit() -> usize {
    4096
}

fn default_sync_short_delay_ms() -> u64 {
    500
}

fn default_sync_servers_delay_ms() -> u64 {
    30_000
}

fn default_sync_socket_timeout_ms() -> u64 {
    5_000
}

fn default_ping_delay_ms() -> u64 {
    15_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            sync_short_delay_ms: default_sync_short_delay_ms(),
            sync_servers_delay_ms: default_sync_servers_delay_ms(),
            sync_socket_timeout_ms: default_sync_socket_timeout_ms(),
            ping_delay_ms: default_ping_delay_ms(),
        }
    }
}

impl SyncTuning {
    pub fn short_delay(&self) -> Duration {
        Duration::from_millis(self.sync_short_delay_ms)
    }

    pub fn servers_delay(&self) -> Duration {
        Duration::from_millis(self.sync_servers_delay_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_socket_timeout_ms)
    }

    pub fn ping_delay(&self) -> Duration {
        Duration::from_millis(self.ping_delay_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for DialInfo {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            direct: false,
            fail_fast: false,
            replica_set_name: None,
            timeout_ms: default_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            pool_limit: default_pool_limit(),
            database: None,
            credential: None,
            mode: Mode::Strong,
            tuning: SyncTuning::default(),
        }
    }
}

impl WolfdocConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfdocConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfdocConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.dial.validate()
    }
}

impl DialInfo {
    /// Validate the dial settings
    pub fn validate(&self) -> crate::Result<()> {
        if self.addrs.is_empty() {
            return Err(crate::Error::Config("dial.addrs cannot be empty".into()));
        }

        if self.addrs.iter().any(|a| a.trim().is_empty()) {
            return Err(crate::Error::Config("dial.addrs cannot contain empty addresses".into()));
        }

        if self.replica_set_name.as_deref() == Some("") {
            return Err(crate::Error::Config("dial.replica_set_name cannot be empty".into()));
        }

        if let Some(cred) = &self.credential {
            if cred.username.is_empty() {
                return Err(crate::Error::Config("dial.credential.username cannot be empty".into()));
            }
        }

        if self.tuning.sync_short_delay_ms == 0 || self.tuning.ping_delay_ms == 0 {
            return Err(crate::Error::Config("dial.tuning delays must be positive".into()));
        }

        Ok(())
    }

    /// Server wait timeout (`None` waits forever)
    pub fn timeout(&self) -> Option<Duration> {
        non_zero_millis(self.timeout_ms)
    }

    /// Socket timeout (`None` disables it)
    pub fn socket_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.socket_timeout_ms)
    }

    /// Parse a connection URL:
    /// `mongodb://[user:pass@]host1[:port][,hostN[:port]][/database][?options]`
    pub fn parse_url(url: &str) -> crate::Result<Self> {
        let invalid = |msg: String| crate::Error::InvalidUrl(msg);
        let rest = url.strip_prefix("mongodb://").unwrap_or(url);

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let (userinfo, rest) = match rest.rsplit_once('@') {
            Some((u, r)) => (Some(u), r),
            None => (None, rest),
        };
        let (hosts, database) = match rest.split_once('/') {
            Some((h, d)) => (h, Some(d)),
            None => (rest, None),
        };

        let mut info = DialInfo::default();
        info.addrs = hosts
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if info.addrs.is_empty() {
            return Err(invalid(format!("no host in {:?}", url)));
        }
        info.database = database.filter(|d| !d.is_empty()).map(str::to_string);

        let mut source = None;
        let mut mechanism = None;
        for pair in query.into_iter().flat_map(|q| q.split(['&', ';'])).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("option {:?} has no value", pair)))?;
            let number = |v: &str| {
                v.parse::<u64>()
                    .map_err(|_| invalid(format!("option {} expects a number, got {:?}", key, v)))
            };
            match key {
                "replicaSet" => info.replica_set_name = Some(value.to_string()),
                "connect" => match value {
                    "direct" => info.direct = true,
                    "replicaSet" => info.direct = false,
                    other => return Err(invalid(format!("unsupported connect mode {:?}", other))),
                },
                "maxPoolSize" => info.pool_limit = number(value)? as usize,
                "authSource" => source = Some(value.to_string()),
                "authMechanism" => mechanism = Some(value.to_string()),
                "connectTimeoutMS" => info.timeout_ms = number(value)?,
                "socketTimeoutMS" => info.socket_timeout_ms = number(value)?,
                "readPreference" => {
                    info.mode = value
                        .parse()
                        .map_err(|_| invalid(format!("unknown read preference {:?}", value)))?
                }
                other => return Err(invalid(format!("unsupported connection URL option: {}={}", other, value))),
            }
        }

        if let Some(userinfo) = userinfo {
            let (user, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
            let username = unescape(user).map_err(invalid)?;
            let password = unescape(password).map_err(invalid)?;
            let source = source
                .or_else(|| info.database.clone())
                .unwrap_or_else(|| "admin".to_string());
            let mut cred = Credential::new(username, password, source);
            if let Some(mechanism) = mechanism {
                cred.mechanism = mechanism;
            }
            info.credential = Some(cred);
        }

        info.validate()?;
        Ok(info)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Decode `%XX` escapes in URL user info
fn unescape(s: &str) -> std::result::Result<String, String> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| format!("{:?} is not valid UTF-8 once decoded", s))
}
