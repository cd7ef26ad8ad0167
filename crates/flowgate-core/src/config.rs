//! Layered settings: built-in defaults, then an optional `flowgate.toml`,
//! then environment variables.
//!
//! The environment is the configuration surface every role shares. The
//! controller hands the fully resolved settings to each child process via
//! [`Settings::to_env`], so a role started by the supervisor sees exactly
//! what the supervisor saw.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::duration::{format_duration, parse_duration, serde_str};
use crate::types::ExecutorMode;

/// Result type alias for settings loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

// ── Environment keys ──────────────────────────────────────────────

pub const ENV_EXECUTOR: &str = "FLOWGATE__CORE__EXECUTOR";
pub const ENV_LOAD_EXAMPLES: &str = "FLOWGATE__CORE__LOAD_EXAMPLES";
pub const ENV_PAUSED_AT_CREATION: &str = "FLOWGATE__CORE__WORKFLOWS_PAUSED_AT_CREATION";
pub const ENV_WORKFLOWS_FOLDER: &str = "FLOWGATE__CORE__WORKFLOWS_FOLDER";
pub const ENV_SCRIPTS_FOLDER: &str = "FLOWGATE__CORE__SCRIPTS_FOLDER";
pub const ENV_DATA_FOLDER: &str = "FLOWGATE__CORE__DATA_FOLDER";
pub const ENV_ENV_FILE: &str = "FLOWGATE__CORE__ENV_FILE";
pub const ENV_IN_CONTAINER: &str = "FLOWGATE_IN_CONTAINER";
pub const ENV_STORE_URL: &str = "FLOWGATE__STORE__URL";
pub const ENV_DB_UPGRADE: &str = "_FLOWGATE_DB_UPGRADE";
pub const ENV_USER_CREATE: &str = "_FLOWGATE_WWW_USER_CREATE";
pub const ENV_USER_USERNAME: &str = "_FLOWGATE_WWW_USER_USERNAME";
pub const ENV_USER_PASSWORD: &str = "_FLOWGATE_WWW_USER_PASSWORD";
pub const ENV_WEB_HOST: &str = "FLOWGATE__WEBSERVER__HOST";
pub const ENV_WEB_PORT: &str = "FLOWGATE__WEBSERVER__PORT";
pub const ENV_READINESS_INTERVAL: &str = "FLOWGATE__READINESS__INTERVAL";
pub const ENV_READINESS_ATTEMPTS: &str = "FLOWGATE__READINESS__ATTEMPTS";
pub const ENV_READINESS_TIMEOUT: &str = "FLOWGATE__READINESS__TIMEOUT";
pub const ENV_HEALTH_INTERVAL: &str = "FLOWGATE__HEALTH__INTERVAL";
pub const ENV_HEALTH_TIMEOUT: &str = "FLOWGATE__HEALTH__TIMEOUT";
pub const ENV_HEALTH_THRESHOLD: &str = "FLOWGATE__HEALTH__UNHEALTHY_THRESHOLD";
pub const ENV_HEALTH_START_PERIOD: &str = "FLOWGATE__HEALTH__START_PERIOD";
pub const ENV_RESTART_DELAY: &str = "FLOWGATE__SUPERVISOR__RESTART_DELAY";
pub const ENV_RESTART_DELAY_MAX: &str = "FLOWGATE__SUPERVISOR__RESTART_DELAY_MAX";
pub const ENV_ALERT_WINDOW: &str = "FLOWGATE__SUPERVISOR__ALERT_WINDOW";
pub const ENV_ALERT_THRESHOLD: &str = "FLOWGATE__SUPERVISOR__ALERT_THRESHOLD";
pub const ENV_GRACE_PERIOD: &str = "FLOWGATE__SUPERVISOR__GRACE_PERIOD";
pub const ENV_INIT_TIMEOUT: &str = "FLOWGATE__SUPERVISOR__INIT_TIMEOUT";
pub const ENV_PROGRAM: &str = "FLOWGATE__SUPERVISOR__PROGRAM";
pub const ENV_SCHEDULER_TICK: &str = "FLOWGATE__SCHEDULER__TICK";
pub const ENV_HEARTBEAT_TIMEOUT: &str = "FLOWGATE__SCHEDULER__HEARTBEAT_TIMEOUT";

// ── Sections ──────────────────────────────────────────────────────

/// Resolved settings for every role of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub core: CoreSettings,
    pub store: StoreSettings,
    pub bootstrap: BootstrapSettings,
    pub webserver: WebserverSettings,
    pub readiness: ReadinessSettings,
    pub health: HealthSettings,
    pub supervisor: SupervisorSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    pub executor: ExecutorMode,
    /// Register the built-in example workflows.
    pub load_examples: bool,
    /// New workflow definitions start paused.
    pub workflows_paused_at_creation: bool,
    /// Set when running inside a container; passed through untouched.
    pub in_container: bool,
    pub workflows_folder: Option<PathBuf>,
    pub scripts_folder: Option<PathBuf>,
    pub data_folder: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            executor: ExecutorMode::default(),
            load_examples: true,
            workflows_paused_at_creation: true,
            in_container: false,
            workflows_folder: None,
            scripts_folder: None,
            data_folder: None,
            env_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// `postgres://…`, `redb://<path>`, or `memory://`.
    pub url: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
        }
    }
}

/// First-run flags consumed by the initializer.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    pub db_upgrade: bool,
    pub user_create: bool,
    pub username: String,
    pub password: Option<String>,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            db_upgrade: false,
            user_create: false,
            username: "admin".to_string(),
            password: None,
        }
    }
}

impl fmt::Debug for BootstrapSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapSettings")
            .field("db_upgrade", &self.db_upgrade)
            .field("user_create", &self.user_create)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebserverSettings {
    pub host: String,
    pub port: u16,
}

impl Default for WebserverSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl WebserverSettings {
    /// Address the API server binds.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address the supervisor probes. Wildcard binds are probed on loopback.
    pub fn probe_addr(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
            other => other,
        };
        format!("{host}:{}", self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Total probe attempts before the store is declared unreachable.
    pub attempts: u32,
    #[serde(with = "serde_str")]
    pub timeout: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            attempts: 5,
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    #[serde(with = "serde_str")]
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    /// Grace window after a (re)start in which probe failures don't count.
    #[serde(with = "serde_str")]
    pub start_period: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            start_period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    #[serde(with = "serde_str")]
    pub restart_delay: Duration,
    #[serde(with = "serde_str")]
    pub restart_delay_max: Duration,
    #[serde(with = "serde_str")]
    pub alert_window: Duration,
    /// Restarts inside `alert_window` that raise a restart-storm alert.
    pub alert_threshold: u32,
    #[serde(with = "serde_str")]
    pub grace_period: Duration,
    /// Longest the initializer child may run before `up` gives up on it.
    #[serde(with = "serde_str")]
    pub init_timeout: Duration,
    /// Control-plane executable. Defaults to the running binary.
    pub program: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
            restart_delay_max: Duration::from_secs(10),
            alert_window: Duration::from_secs(60),
            alert_threshold: 5,
            grace_period: Duration::from_secs(10),
            init_timeout: Duration::from_secs(600),
            program: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    #[serde(with = "serde_str")]
    pub tick: Duration,
    /// A scheduler heartbeat older than this is reported unhealthy.
    #[serde(with = "serde_str")]
    pub heartbeat_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Settings {
    /// Defaults, overlaid by `path` (if any), overlaid by the process
    /// environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&content)?;
        debug!(?path, "settings file loaded");
        Ok(settings)
    }

    /// Overlay recognized `FLOWGATE*` variables. Unknown keys are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                ENV_EXECUTOR => {
                    self.core.executor = value
                        .parse()
                        .map_err(|reason| invalid(key, value, reason))?;
                }
                ENV_LOAD_EXAMPLES => self.core.load_examples = env_bool(key, value)?,
                ENV_PAUSED_AT_CREATION => {
                    self.core.workflows_paused_at_creation = env_bool(key, value)?;
                }
                ENV_IN_CONTAINER => self.core.in_container = env_bool(key, value)?,
                ENV_WORKFLOWS_FOLDER => self.core.workflows_folder = env_path(value),
                ENV_SCRIPTS_FOLDER => self.core.scripts_folder = env_path(value),
                ENV_DATA_FOLDER => self.core.data_folder = env_path(value),
                ENV_ENV_FILE => self.core.env_file = env_path(value),
                ENV_STORE_URL => self.store.url = value.to_string(),
                ENV_DB_UPGRADE => self.bootstrap.db_upgrade = env_bool(key, value)?,
                ENV_USER_CREATE => self.bootstrap.user_create = env_bool(key, value)?,
                ENV_USER_USERNAME => self.bootstrap.username = value.to_string(),
                ENV_USER_PASSWORD => self.bootstrap.password = Some(value.to_string()),
                ENV_WEB_HOST => self.webserver.host = value.to_string(),
                ENV_WEB_PORT => self.webserver.port = env_num(key, value)?,
                ENV_READINESS_INTERVAL => self.readiness.interval = env_duration(key, value)?,
                ENV_READINESS_ATTEMPTS => self.readiness.attempts = env_num(key, value)?,
                ENV_READINESS_TIMEOUT => self.readiness.timeout = env_duration(key, value)?,
                ENV_HEALTH_INTERVAL => self.health.interval = env_duration(key, value)?,
                ENV_HEALTH_TIMEOUT => self.health.timeout = env_duration(key, value)?,
                ENV_HEALTH_THRESHOLD => self.health.unhealthy_threshold = env_num(key, value)?,
                ENV_HEALTH_START_PERIOD => self.health.start_period = env_duration(key, value)?,
                ENV_RESTART_DELAY => self.supervisor.restart_delay = env_duration(key, value)?,
                ENV_RESTART_DELAY_MAX => {
                    self.supervisor.restart_delay_max = env_duration(key, value)?;
                }
                ENV_ALERT_WINDOW => self.supervisor.alert_window = env_duration(key, value)?,
                ENV_ALERT_THRESHOLD => self.supervisor.alert_threshold = env_num(key, value)?,
                ENV_GRACE_PERIOD => self.supervisor.grace_period = env_duration(key, value)?,
                ENV_INIT_TIMEOUT => self.supervisor.init_timeout = env_duration(key, value)?,
                ENV_PROGRAM => self.supervisor.program = env_path(value),
                ENV_SCHEDULER_TICK => self.scheduler.tick = env_duration(key, value)?,
                ENV_HEARTBEAT_TIMEOUT => {
                    self.scheduler.heartbeat_timeout = env_duration(key, value)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject settings no role can run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.store.url.trim().is_empty() {
            return Err(ConfigError::Invalid("store url is empty".into()));
        }
        if self.readiness.attempts == 0 {
            return Err(ConfigError::Invalid("readiness attempts must be at least 1".into()));
        }
        if self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health unhealthy_threshold must be at least 1".into(),
            ));
        }
        if self.supervisor.restart_delay > self.supervisor.restart_delay_max {
            return Err(ConfigError::Invalid(
                "supervisor restart_delay exceeds restart_delay_max".into(),
            ));
        }
        if self.supervisor.init_timeout.is_zero() {
            return Err(ConfigError::Invalid("supervisor init_timeout must be non-zero".into()));
        }
        if self.scheduler.tick.is_zero() {
            return Err(ConfigError::Invalid("scheduler tick must be non-zero".into()));
        }
        Ok(())
    }

    /// The settings as environment variables, for child processes.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (ENV_EXECUTOR, self.core.executor.to_string()),
            (ENV_LOAD_EXAMPLES, self.core.load_examples.to_string()),
            (
                ENV_PAUSED_AT_CREATION,
                self.core.workflows_paused_at_creation.to_string(),
            ),
            (ENV_IN_CONTAINER, self.core.in_container.to_string()),
            (ENV_STORE_URL, self.store.url.clone()),
            (ENV_DB_UPGRADE, self.bootstrap.db_upgrade.to_string()),
            (ENV_USER_CREATE, self.bootstrap.user_create.to_string()),
            (ENV_USER_USERNAME, self.bootstrap.username.clone()),
            (ENV_WEB_HOST, self.webserver.host.clone()),
            (ENV_WEB_PORT, self.webserver.port.to_string()),
            (ENV_READINESS_INTERVAL, format_duration(self.readiness.interval)),
            (ENV_READINESS_ATTEMPTS, self.readiness.attempts.to_string()),
            (ENV_READINESS_TIMEOUT, format_duration(self.readiness.timeout)),
            (ENV_HEALTH_INTERVAL, format_duration(self.health.interval)),
            (ENV_HEALTH_TIMEOUT, format_duration(self.health.timeout)),
            (ENV_HEALTH_THRESHOLD, self.health.unhealthy_threshold.to_string()),
            (ENV_HEALTH_START_PERIOD, format_duration(self.health.start_period)),
            (ENV_RESTART_DELAY, format_duration(self.supervisor.restart_delay)),
            (ENV_RESTART_DELAY_MAX, format_duration(self.supervisor.restart_delay_max)),
            (ENV_ALERT_WINDOW, format_duration(self.supervisor.alert_window)),
            (ENV_ALERT_THRESHOLD, self.supervisor.alert_threshold.to_string()),
            (ENV_GRACE_PERIOD, format_duration(self.supervisor.grace_period)),
            (ENV_INIT_TIMEOUT, format_duration(self.supervisor.init_timeout)),
            (ENV_SCHEDULER_TICK, format_duration(self.scheduler.tick)),
            (ENV_HEARTBEAT_TIMEOUT, format_duration(self.scheduler.heartbeat_timeout)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<Vec<_>>();

        if let Some(password) = &self.bootstrap.password {
            env.push((ENV_USER_PASSWORD.to_string(), password.clone()));
        }
        let paths = [
            (ENV_WORKFLOWS_FOLDER, &self.core.workflows_folder),
            (ENV_SCRIPTS_FOLDER, &self.core.scripts_folder),
            (ENV_DATA_FOLDER, &self.core.data_folder),
            (ENV_ENV_FILE, &self.core.env_file),
            (ENV_PROGRAM, &self.supervisor.program),
        ];
        for (key, path) in paths {
            if let Some(path) = path {
                env.push((key.to_string(), path.display().to_string()));
            }
        }
        env
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn env_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

fn env_num<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "expected a number"))
}

fn env_duration(key: &str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| invalid(key, value, "expected a duration like 5s"))
}

fn env_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}
