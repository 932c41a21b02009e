//! Daemon configuration.
//!
//! Settings come from three places with increasing precedence: the
//! configuration file, command-line flags, and `--define key=value`
//! overrides (each treated as one inline file line). The file format is
//! `key = value` with dotted keys, `#`/`;` comments, and optional quoting
//! of values.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::role::Role;

/// Default listener endpoint: a filesystem socket.
pub const DEFAULT_LISTEN_SOCKET: &str = "/tmp/.newrelic.sock";

/// Default ingestion service host.
pub const DEFAULT_COLLECTOR_HOST: &str = "collector.newrelic.com";

/// Default inactivity window after which an application entry is evicted.
pub const DEFAULT_APP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default harvest cycle length.
pub const DEFAULT_HARVEST_PERIOD: Duration = Duration::from_secs(60);

/// Error raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read at all.
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A line was not of the form `key = value`.
    #[error("line {line}: expected `key = value`, found {text:?}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Offending text.
        text: String,
    },

    /// The key is not a recognised setting.
    #[error("line {line}: unknown setting {key:?}")]
    UnknownKey {
        /// 1-based line number.
        line: usize,
        /// Offending key.
        key: String,
    },

    /// The value could not be parsed for its setting.
    #[error("line {line}: invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// 1-based line number.
        line: usize,
        /// Setting name.
        key: String,
        /// Offending value.
        value: String,
        /// What was expected.
        reason: String,
    },
}

/// Log verbosity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Errors and warnings.
    Warning,
    /// Normal operational messages.
    #[default]
    Info,
    /// Everything, including per-frame noise.
    Debug,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "debug" | "verbose" | "verbosedebug" => Ok(Self::Debug),
            _ => Err(format!(
                "unknown log level {s:?} (expected error, warning, info or debug)"
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// A duration setting.
///
/// Accepts humantime literals (`10m`, `90s`, `1h 30m`) as well as a bare
/// integer, which is read as seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(pub Duration);

impl Timeout {
    /// The wrapped duration.
    #[must_use]
    pub const fn duration(self) -> Duration {
        self.0
    }
}

impl FromStr for Timeout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Self(Duration::from_secs(secs)));
        }
        humantime::parse_duration(s)
            .map(Self)
            .map_err(|e| e.to_string())
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

/// Host-fact settings used by the `--utilization` report.
///
/// The detection booleans are accepted for compatibility with existing
/// configuration files; this daemon performs no cloud or container
/// probing, so only the manual overrides affect the report.
#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationConfig {
    /// Accepted: would enable AWS detection.
    pub detect_aws: bool,
    /// Accepted: would enable Azure detection.
    pub detect_azure: bool,
    /// Accepted: would enable GCP detection.
    pub detect_gcp: bool,
    /// Accepted: would enable PCF detection.
    pub detect_pcf: bool,
    /// Accepted: would enable Docker detection.
    pub detect_docker: bool,
    /// Operator-provided logical processor count.
    pub logical_processors: Option<u64>,
    /// Operator-provided total RAM in mebibytes.
    pub total_ram_mib: Option<u64>,
    /// Operator-provided hostname for billing purposes.
    pub billing_hostname: String,
}

impl Default for UtilizationConfig {
    fn default() -> Self {
        Self {
            detect_aws: true,
            detect_azure: true,
            detect_gcp: true,
            detect_pcf: true,
            detect_docker: true,
            logical_processors: None,
            total_ram_mib: None,
            billing_hostname: String::new(),
        }
    }
}

/// Effective daemon settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Listener bind endpoint: numeric port, `host:port`, or socket path.
    pub bind_addr: String,
    /// Deprecated listener setting; folded into `bind_addr` by the CLI.
    pub bind_port: String,
    /// Proxy URL for reaching the ingestion service.
    pub proxy: String,
    /// Path to the daemon pid file; empty disables it.
    pub pidfile: String,
    /// Suppress pid-file creation even when a path is configured. Set on
    /// workers spawned by a watcher, which already holds the lock.
    pub no_pidfile: bool,
    /// Path to the daemon log file; empty selects the standard locations.
    pub logfile: String,
    /// Log verbosity.
    pub loglevel: LogLevel,
    /// Path to the audit log; empty disables it.
    pub auditlog: String,
    /// Path to a PEM bundle of root CA certificates.
    pub ca_file: String,
    /// Path to a directory of PEM root CA certificates.
    pub ca_path: String,
    /// Ingestion service host, or a full URL for testing.
    pub collector: String,
    /// Inactivity window after which an application entry is evicted.
    pub app_timeout: Timeout,
    /// Length of one harvest cycle.
    pub harvest_period: Timeout,
    /// Soft limit requested for open file descriptors.
    pub max_files: u64,
    /// Host-fact settings.
    pub utilization: UtilizationConfig,

    /// Path of the parsed configuration file, if any. Not a file setting.
    pub config_file: String,
    /// Remain in the foreground (the process is its own worker).
    pub foreground: bool,
    /// Whether the daemon was spawned by an instrumented process.
    pub agent: bool,
    /// Role of this process in the supervision chain.
    pub role: Role,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_LISTEN_SOCKET.to_string(),
            bind_port: String::new(),
            proxy: String::new(),
            pidfile: String::new(),
            no_pidfile: false,
            logfile: String::new(),
            loglevel: LogLevel::default(),
            auditlog: String::new(),
            ca_file: String::new(),
            ca_path: String::new(),
            collector: DEFAULT_COLLECTOR_HOST.to_string(),
            app_timeout: Timeout(DEFAULT_APP_TIMEOUT),
            harvest_period: Timeout(DEFAULT_HARVEST_PERIOD),
            max_files: 2048,
            utilization: UtilizationConfig::default(),
            config_file: String::new(),
            foreground: false,
            agent: false,
            role: Role::default(),
        }
    }
}

impl Config {
    /// Parse a configuration file into `self`, overwriting any settings it
    /// names.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the offending line on the first
    /// problem found.
    pub fn parse_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        self.config_file = path.display().to_string();
        self.parse_str(&text)
    }

    /// Parse configuration text into `self`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the offending line on the first
    /// problem found.
    pub fn parse_str(&mut self, text: &str) -> Result<(), ConfigError> {
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            let (key, value) = trimmed
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed {
                    line,
                    text: trimmed.to_string(),
                })?;
            self.apply(key.trim(), unquote(value.trim()), line)?;
        }
        Ok(())
    }

    /// Apply one `key=value` override, as given to `--define`.
    ///
    /// Defines are parsed exactly like a config-file line and take
    /// precedence over both the file and ordinary flags, so they are
    /// applied last.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the setting is unknown or the value is
    /// invalid; the reported line number is always 1.
    pub fn apply_define(&mut self, define: &str) -> Result<(), ConfigError> {
        let (key, value) = define
            .split_once('=')
            .ok_or_else(|| ConfigError::Malformed {
                line: 1,
                text: define.to_string(),
            })?;
        self.apply(key.trim(), unquote(value.trim()), 1)
    }

    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "addr" => self.bind_addr = value.to_string(),
            "port" => self.bind_port = value.to_string(),
            "proxy" => self.proxy = value.to_string(),
            "pidfile" => self.pidfile = value.to_string(),
            "logfile" => self.logfile = value.to_string(),
            "loglevel" => self.loglevel = parse_value(key, value, line)?,
            "auditlog" => self.auditlog = value.to_string(),
            "ssl_ca_bundle" => self.ca_file = value.to_string(),
            "ssl_ca_path" => self.ca_path = value.to_string(),
            "collector" => self.collector = value.to_string(),
            "app_timeout" => self.app_timeout = parse_value(key, value, line)?,
            "harvest_period" => self.harvest_period = parse_value(key, value, line)?,
            "rlimit_files" => self.max_files = parse_value(key, value, line)?,
            "utilization.detect_aws" => {
                self.utilization.detect_aws = parse_bool(key, value, line)?;
            }
            "utilization.detect_azure" => {
                self.utilization.detect_azure = parse_bool(key, value, line)?;
            }
            "utilization.detect_gcp" => {
                self.utilization.detect_gcp = parse_bool(key, value, line)?;
            }
            "utilization.detect_pcf" => {
                self.utilization.detect_pcf = parse_bool(key, value, line)?;
            }
            "utilization.detect_docker" => {
                self.utilization.detect_docker = parse_bool(key, value, line)?;
            }
            "utilization.logical_processors" => {
                self.utilization.logical_processors = Some(parse_value(key, value, line)?);
            }
            "utilization.total_ram_mib" => {
                self.utilization.total_ram_mib = Some(parse_value(key, value, line)?);
            }
            "utilization.billing_hostname" => {
                self.utilization.billing_hostname = value.to_string();
            }
            _ => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn parse_value<T>(key: &str, value: &str, line: usize) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str, line: usize) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
