//! Runtime configuration for every Fiber process.
//!
//! Configuration is a TOML file whose sections mirror the historical INI
//! settings file, so an existing `[AutoTimeOut]` block keeps working:
//!
//! ```toml
//! [AutoTimeOut]
//! KillOnTimeOut = true
//! RefreshInterval = 5000   # ms
//! TimeOutInterval = 10000  # ms
//!
//! [Watchdog]
//! Interval = 10000
//! ConnectTimeout = 3000
//!
//! [Restart]
//! MaxAttempts = 5
//! BackoffFirst = 100
//! BackoffMax = 5000
//! BackoffFactor = 2.0
//!
//! [Endpoints]
//! RuntimeDir = "/tmp"
//! Main = "Fiber"
//! Control = "FiberControl"
//! ```
//!
//! Every key is optional. All durations are milliseconds.
//!
//! The daemon forwards the file it loaded to its children through
//! [`CONFIG_ENV`], and the runtime directory through [`RUNTIME_DIR_ENV`],
//! so the whole process graph agrees on endpoint locations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "FIBER_CONFIG";

/// Environment variable overriding `[Endpoints] RuntimeDir`.
pub const RUNTIME_DIR_ENV: &str = "FIBER_RUNTIME_DIR";

/// Errors while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: std::io::Error },

    #[error("Invalid config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

// ============================================================================
// Sections
// ============================================================================

/// `[AutoTimeOut]`: idle self-termination of handler processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AutoTimeOutConfig {
    pub kill_on_time_out: bool,
    pub refresh_interval: u64,
    pub time_out_interval: u64,
}

impl Default for AutoTimeOutConfig {
    fn default() -> Self {
        Self {
            kill_on_time_out: true,
            refresh_interval: 5_000,
            time_out_interval: 10_000,
        }
    }
}

/// `[Watchdog]`: surrogate liveness probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct WatchdogConfig {
    pub interval: u64,
    pub connect_timeout: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: 10_000,
            connect_timeout: 3_000,
        }
    }
}

/// `[Restart]`: bounded relaunch of crashed processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RestartConfig {
    pub max_attempts: u32,
    pub backoff_first: u64,
    pub backoff_max: u64,
    pub backoff_factor: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_first: 100,
            backoff_max: 5_000,
            backoff_factor: 2.0,
        }
    }
}

/// `[Timeouts]`: bounds on every wait that depends on another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TimeoutConfig {
    /// How long a HANDLER request waits for a fresh handler's handshake.
    pub handshake: u64,
    pub connect: u64,
    pub read: u64,
    pub write: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake: 10_000,
            connect: 3_000,
            read: 30_000,
            write: 10_000,
        }
    }
}

/// `[Endpoints]`: where sockets live and the well-known names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct EndpointConfig {
    pub runtime_dir: Option<PathBuf>,
    pub main: String,
    pub control: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            main: "Fiber".to_string(),
            control: "FiberControl".to_string(),
        }
    }
}

/// `[Programs]`: executables spawned for handlers and surrogates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ProgramConfig {
    pub handler: String,
    pub surrogate: String,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            handler: "fiber-handler".to_string(),
            surrogate: "fiber-surrogate".to_string(),
        }
    }
}

// ============================================================================
// Fiber Config
// ============================================================================

/// Complete configuration shared by all Fiber processes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct FiberConfig {
    pub auto_time_out: AutoTimeOutConfig,
    pub watchdog: WatchdogConfig,
    pub restart: RestartConfig,
    pub timeouts: TimeoutConfig,
    pub endpoints: EndpointConfig,
    pub programs: ProgramConfig,

    /// File this configuration was read from, forwarded to children.
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl FiberConfig {
    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads configuration from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        let mut config = Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.source = Some(path.to_path_buf());
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Resolves and loads the configuration for this process.
    ///
    /// Lookup order: `explicit`, then [`CONFIG_ENV`], then
    /// `<config_dir>/fiber/fiber.toml`. A missing file yields the
    /// defaults; a file that exists but does not parse is an error.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let candidate = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(Self::default_path);

        match candidate {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                if explicit.is_some() {
                    warn!(path = %path.display(), "Config file not found, using defaults");
                } else {
                    debug!(path = %path.display(), "No config file, using defaults");
                }
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// `<config_dir>/fiber/fiber.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fiber").join("fiber.toml"))
    }

    /// File this configuration was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Directory holding every endpoint socket.
    ///
    /// [`RUNTIME_DIR_ENV`] wins over the file so tests and parent
    /// processes can relocate a whole process graph.
    pub fn runtime_dir(&self) -> PathBuf {
        std::env::var_os(RUNTIME_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| self.endpoints.runtime_dir.clone())
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Same configuration with `[Endpoints] RuntimeDir` set to `dir`.
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.endpoints.runtime_dir = Some(dir.into());
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.auto_time_out.refresh_interval)
    }

    pub fn time_out_interval(&self) -> Duration {
        Duration::from_millis(self.auto_time_out.time_out_interval)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog.interval)
    }

    pub fn watchdog_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog.connect_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.handshake)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.read)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_historical_settings() {
        let config = FiberConfig::default();
        assert!(config.auto_time_out.kill_on_time_out);
        assert_eq!(config.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.time_out_interval(), Duration::from_secs(10));
        assert_eq!(config.watchdog_interval(), Duration::from_secs(10));
        assert_eq!(config.endpoints.main, "Fiber");
        assert_eq!(config.endpoints.control, "FiberControl");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = FiberConfig::parse(
            r#"
            [AutoTimeOut]
            KillOnTimeOut = false
            TimeOutInterval = 2500
            "#,
        )
        .unwrap();

        assert!(!config.auto_time_out.kill_on_time_out);
        assert_eq!(config.auto_time_out.refresh_interval, 5_000);
        assert_eq!(config.time_out_interval(), Duration::from_millis(2500));
        assert_eq!(config.restart, RestartConfig::default());
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        let result = FiberConfig::parse("[Watchdog]\nInterval = \"soon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_records_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[Endpoints]\nMain = \"FiberTest\"").unwrap();

        let config = FiberConfig::load(file.path()).unwrap();
        assert_eq!(config.endpoints.main, "FiberTest");
        assert_eq!(config.source(), Some(file.path()));
    }

    #[test]
    fn test_load_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[Restart\nMaxAttempts = 1").unwrap();

        let err = FiberConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_discover_missing_explicit_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FiberConfig::discover(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.endpoints, EndpointConfig::default());
        assert!(config.source().is_none());
    }
}
