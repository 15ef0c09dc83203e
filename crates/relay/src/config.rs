//! Configuration management for the ShellRelay relay.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellrelay/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen must be a socket address like 127.0.0.1:5555, got {0}")]
    InvalidListenAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("max_message_bytes must be between 1024 and 16777216, got {0}")]
    InvalidMaxMessageBytes(usize),

    #[error("auth secret must be at least 16 bytes when set, got {0}")]
    SecretTooShort(usize),

    #[error("cookie_name must not be empty")]
    EmptyCookieName,

    #[error("token_ttl_secs must be greater than 0")]
    InvalidTokenTtl,

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("max_sessions_per_owner must be between 1 and max_sessions ({max}), got {got}")]
    InvalidMaxSessionsPerOwner { got: usize, max: usize },

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("{name} program not found: {program}")]
    InvalidLauncher { name: &'static str, program: String },

    #[error("limit {name} must be greater than 0")]
    ZeroLimit { name: &'static str },

    #[error("default geometry must be non-zero, got {0}x{1}")]
    InvalidGeometry(u16, u16),

    #[error("{name} must be greater than 0")]
    ZeroCapacity { name: &'static str },

    #[error("termination_grace_secs must be between 1 and 300, got {0}")]
    InvalidTerminationGrace(u64),

    #[error("idle_timeout_secs must be between 1 and 86400, got {0}")]
    InvalidIdleTimeout(u64),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:5555";

/// Main configuration structure for the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging configuration.
    pub server: ServerConfig,

    /// Auth Guard configuration.
    pub auth: AuthConfig,

    /// Session and process configuration.
    pub session: SessionConfig,

    /// Relay channel tuning.
    pub relay: RelayConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket gateway binds to.
    pub listen: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; rotated daily.
    pub log_file: Option<PathBuf>,

    /// Origins allowed to open a connection. Empty means any origin.
    pub allowed_origins: Vec<String>,

    /// Largest inbound frame accepted, in bytes.
    pub max_message_bytes: usize,
}

/// Auth Guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC key shared with the identity exchange. Empty generates a per-process key.
    pub secret: String,

    /// Name of the cookie carrying the identity token.
    pub cookie_name: String,

    /// Lifetime of tokens issued by `shellrelay token`.
    pub token_ttl_secs: u64,

    /// Clock skew tolerated when checking expiry.
    pub leeway_secs: u64,
}

/// Session and process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell started for interactive sessions.
    pub default_shell: String,

    /// Extra arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Interpreter used for `script` execution requests.
    pub interpreter: String,

    /// Root of per-owner working directories.
    pub workspace_root: PathBuf,

    /// Maximum number of live sessions.
    pub max_sessions: usize,

    /// Maximum number of live sessions per owner.
    pub max_sessions_per_owner: usize,

    /// Default terminal columns.
    pub default_cols: u16,

    /// Default terminal rows.
    pub default_rows: u16,

    /// Environment variables set for every spawned process.
    pub env: Vec<(String, String)>,

    /// Command prepended to every shell, e.g. a container or sandbox wrapper.
    ///
    /// `{owner}`, `{workspace}` and `{session}` are substituted in each
    /// element. Empty runs the shell directly on the host.
    pub shell_launcher: Vec<String>,

    /// Command prepended to every execution, with the same placeholders.
    pub exec_launcher: Vec<String>,

    /// Per-process resource limits.
    pub limits: ResourceLimits,
}

/// Per-process resource limits, applied as rlimits. Unset means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU time, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_secs: Option<u64>,

    /// Address space, in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    /// Processes the owning uid may run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u64>,

    /// Largest file the process may write, in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_mb: Option<u64>,
}

/// Relay channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Outbound queue length per session member, in messages.
    pub member_queue_capacity: usize,

    /// Outbound queue length per connection writer, in messages.
    pub connection_queue_capacity: usize,

    /// Bytes of output buffered before the first join.
    pub pending_buffer_bytes: usize,

    /// Queued input writes per process.
    pub input_queue_capacity: usize,

    /// Seconds between the termination signal and a forced kill.
    pub termination_grace_secs: u64,

    /// Seconds a session may have zero members before it is closed.
    pub idle_timeout_secs: u64,

    /// Milliseconds allowed for trailing output to flush after exit.
    pub drain_grace_millis: u64,

    /// Milliseconds between idle sweeps.
    pub reap_interval_millis: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            log_level: "info".to_string(),
            log_file: None,
            allowed_origins: Vec::new(),
            max_message_bytes: protocol::MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            cookie_name: "session".to_string(),
            token_ttl_secs: 24 * 60 * 60,
            leeway_secs: 30,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            shell_args: Vec::new(),
            interpreter: "python3".to_string(),
            workspace_root: default_workspace_root(),
            max_sessions: 20,
            max_sessions_per_owner: 4,
            default_cols: protocol::messages::DEFAULT_COLS,
            default_rows: protocol::messages::DEFAULT_ROWS,
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            shell_launcher: Vec::new(),
            exec_launcher: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            member_queue_capacity: 256,
            connection_queue_capacity: 1024,
            pending_buffer_bytes: 64 * 1024,
            input_queue_capacity: 256,
            termination_grace_secs: 5,
            idle_timeout_secs: 30,
            drain_grace_millis: 2000,
            reap_interval_millis: 1000,
        }
    }
}

impl RelayConfig {
    /// Grace window between SIGTERM and SIGKILL.
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    /// How long a memberless session survives.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// How long trailing output may take to flush after exit.
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_millis)
    }

    /// Interval of the idle sweep.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_millis.max(10))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellrelay")
        .join("config.toml")
}

/// Returns the default workspace root.
fn default_workspace_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("shellrelay")
        .join("workspaces")
}

/// Returns whether `program` is an existing path or found on PATH.
fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(program).is_ok()
    }
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLRELAY_LISTEN: Override the listen address
    /// - SHELLRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHELLRELAY_AUTH_SECRET: Override the token signing secret
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("SHELLRELAY_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen address from environment: {}", listen);
                self.server.listen = listen;
            }
        }

        if let Ok(level) = std::env::var("SHELLRELAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(secret) = std::env::var("SHELLRELAY_AUTH_SECRET") {
            if !secret.is_empty() {
                tracing::info!("Using auth secret from environment");
                self.auth.secret = secret;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddress(self.server.listen.clone()));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if !(1024..=16 * 1024 * 1024).contains(&self.server.max_message_bytes) {
            return Err(ConfigError::InvalidMaxMessageBytes(
                self.server.max_message_bytes,
            ));
        }

        if !self.auth.secret.is_empty() && self.auth.secret.len() < 16 {
            return Err(ConfigError::SecretTooShort(self.auth.secret.len()));
        }

        if self.auth.cookie_name.trim().is_empty() {
            return Err(ConfigError::EmptyCookieName);
        }

        if self.auth.token_ttl_secs == 0 {
            return Err(ConfigError::InvalidTokenTtl);
        }

        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.max_sessions_per_owner < 1
            || self.session.max_sessions_per_owner > self.session.max_sessions
        {
            return Err(ConfigError::InvalidMaxSessionsPerOwner {
                got: self.session.max_sessions_per_owner,
                max: self.session.max_sessions,
            });
        }

        if !program_exists(&self.session.default_shell) {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let launchers = [
            ("shell_launcher", &self.session.shell_launcher),
            ("exec_launcher", &self.session.exec_launcher),
        ];
        for (name, launcher) in launchers {
            if let Some(program) = launcher.first() {
                if !program_exists(program) {
                    return Err(ConfigError::InvalidLauncher {
                        name,
                        program: program.clone(),
                    });
                }
            }
        }

        let limits = [
            ("cpu_secs", self.session.limits.cpu_secs),
            ("memory_mb", self.session.limits.memory_mb),
            ("max_processes", self.session.limits.max_processes),
            ("max_file_mb", self.session.limits.max_file_mb),
        ];
        for (name, value) in limits {
            if value == Some(0) {
                return Err(ConfigError::ZeroLimit { name });
            }
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidGeometry(
                self.session.default_cols,
                self.session.default_rows,
            ));
        }

        let capacities = [
            ("member_queue_capacity", self.relay.member_queue_capacity),
            (
                "connection_queue_capacity",
                self.relay.connection_queue_capacity,
            ),
            ("pending_buffer_bytes", self.relay.pending_buffer_bytes),
            ("input_queue_capacity", self.relay.input_queue_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity { name });
            }
        }

        if !(1..=300).contains(&self.relay.termination_grace_secs) {
            return Err(ConfigError::InvalidTerminationGrace(
                self.relay.termination_grace_secs,
            ));
        }

        if !(1..=86_400).contains(&self.relay.idle_timeout_secs) {
            return Err(ConfigError::InvalidIdleTimeout(self.relay.idle_timeout_secs));
        }

        Ok(())
    }

    /// Returns the parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.listen, DEFAULT_LISTEN);
        assert_eq!(config.server.log_level, "info");
        assert!(config.server.allowed_origins.is_empty());
        assert_eq!(config.auth.cookie_name, "session");
        assert!(config.auth.secret.is_empty());
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.session.interpreter, "python3");
        assert_eq!(config.relay.termination_grace_secs, 5);
        assert_eq!(config.relay.idle_timeout_secs, 30);
    }

    #[test]
    fn test_default_geometry_matches_protocol() {
        let config = SessionConfig::default();
        assert_eq!(config.default_cols, 80);
        assert_eq!(config.default_rows, 24);
    }

    #[test]
    fn test_relay_durations() {
        let relay = RelayConfig::default();
        assert_eq!(relay.termination_grace(), Duration::from_secs(5));
        assert_eq!(relay.idle_timeout(), Duration::from_secs(30));
        assert_eq!(relay.drain_grace(), Duration::from_millis(2000));
        assert_eq!(relay.reap_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
listen = "0.0.0.0:9000"

[relay]
idle_timeout_secs = 90
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.relay.idle_timeout_secs, 90);
        // Untouched values keep their defaults
        assert_eq!(config.relay.termination_grace_secs, 5);
        assert_eq!(config.auth, AuthConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[server]
listen = "127.0.0.1:7000"
log_level = "debug"
log_file = "/var/log/shellrelay.log"
allowed_origins = ["http://localhost:5173"]
max_message_bytes = 65536

[auth]
secret = "0123456789abcdef0123"
cookie_name = "paas"
token_ttl_secs = 600
leeway_secs = 5

[session]
default_shell = "/bin/bash"
shell_args = ["--login"]
interpreter = "python3.11"
workspace_root = "/tmp/paas_uploads"
max_sessions = 50
max_sessions_per_owner = 2
default_cols = 100
default_rows = 30
env = [["LANG", "C.UTF-8"]]
shell_launcher = ["docker", "run", "--rm", "-it", "--network=none", "--cap-drop=ALL", "-v", "{workspace}:/work", "-w", "/work", "sandbox:latest"]

[session.limits]
cpu_secs = 300
memory_mb = 512

[relay]
member_queue_capacity = 64
connection_queue_capacity = 128
pending_buffer_bytes = 4096
input_queue_capacity = 32
termination_grace_secs = 3
idle_timeout_secs = 10
drain_grace_millis = 500
reap_interval_millis = 250
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.log_file, Some(PathBuf::from("/var/log/shellrelay.log")));
        assert_eq!(config.server.allowed_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.auth.cookie_name, "paas");
        assert_eq!(config.session.shell_args, vec!["--login"]);
        assert_eq!(config.session.workspace_root, PathBuf::from("/tmp/paas_uploads"));
        assert_eq!(
            config.session.env,
            vec![("LANG".to_string(), "C.UTF-8".to_string())]
        );
        assert_eq!(config.session.shell_launcher[0], "docker");
        assert!(config.session.exec_launcher.is_empty());
        assert_eq!(
            config.session.limits,
            ResourceLimits {
                cpu_secs: Some(300),
                memory_mb: Some(512),
                ..ResourceLimits::default()
            }
        );
        assert_eq!(config.relay.pending_buffer_bytes, 4096);
        assert_eq!(config.relay.reap_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nlisten = ");
        assert!(result.is_err());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[session]\nmax_sessions = \"many\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[server]
listen = "127.0.0.1:1234"
flux_capacitor = true

[mystery]
value = 1
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:1234");
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = valid_config();
        config.relay.idle_timeout_secs = 45;
        config.save(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/shellrelay/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("shellrelay/config.toml"));
    }

    #[test]
    fn test_validate_default_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_listen_address() {
        let mut config = valid_config();
        config.server.listen = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddress("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.server.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );

        config.server.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_short_secret() {
        let mut config = valid_config();
        config.auth.secret = "short".to_string();
        assert_eq!(config.validate(), Err(ConfigError::SecretTooShort(5)));
    }

    #[test]
    fn test_validate_session_limits() {
        let mut config = valid_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        let mut config = valid_config();
        config.session.max_sessions = 3;
        config.session.max_sessions_per_owner = 4;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxSessionsPerOwner { got: 4, max: 3 })
        );
    }

    #[test]
    fn test_validate_missing_shell() {
        let mut config = valid_config();
        config.session.default_shell = "/definitely/not/a/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/definitely/not/a/shell".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_launcher() {
        let mut config = valid_config();
        config.session.exec_launcher = vec!["/bin/sh".to_string(), "-c".to_string()];
        assert!(config.validate().is_ok());

        config.session.shell_launcher = vec!["no-such-sandbox-wrapper".to_string()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLauncher {
                name: "shell_launcher",
                program: "no-such-sandbox-wrapper".to_string()
            })
        );
    }

    #[test]
    fn test_validate_zero_limit() {
        let mut config = valid_config();
        config.session.limits.memory_mb = Some(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroLimit { name: "memory_mb" })
        );
    }

    #[test]
    fn test_validate_zero_capacity() {
        let mut config = valid_config();
        config.relay.member_queue_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCapacity {
                name: "member_queue_capacity"
            })
        );
    }

    #[test]
    fn test_validate_grace_windows() {
        let mut config = valid_config();
        config.relay.termination_grace_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminationGrace(0))
        );

        let mut config = valid_config();
        config.relay.idle_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidIdleTimeout(0)));
    }

    #[test]
    #[serial]
    fn test_env_override_listen() {
        std::env::set_var("SHELLRELAY_LISTEN", "0.0.0.0:8080");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.listen, "0.0.0.0:8080");

        std::env::remove_var("SHELLRELAY_LISTEN");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SHELLRELAY_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.log_level, "info");

        std::env::remove_var("SHELLRELAY_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_secret() {
        std::env::remove_var("SHELLRELAY_LISTEN");
        std::env::set_var("SHELLRELAY_AUTH_SECRET", "environment-secret-value");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.auth.secret, "environment-secret-value");

        std::env::remove_var("SHELLRELAY_AUTH_SECRET");
    }
}
