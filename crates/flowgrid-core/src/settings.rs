//! `flowgrid.toml` parsing, environment overrides and resolution.
//!
//! Settings are layered: file (every field defaulted), then `FLOWGRID_*`
//! environment variables, then [`Settings::resolve`], which substitutes
//! `${home}` in paths and rejects zero batch sizes and intervals.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

pub const ENV_PREFIX: &str = "FLOWGRID_";
const HOME_TEMPLATE: &str = "${home}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base directory; `${home}` in other paths expands to this.
    pub home: String,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub services: ServicesSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home: "~/.flowgrid".into(),
            logging: LoggingSettings::default(),
            store: StoreSettings::default(),
            services: ServicesSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format `{other}`, expected text or json")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: String,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: format!("{HOME_TEMPLATE}/flowgrid.redb"),
            retry_attempts: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl StoreSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesSettings {
    pub scheduler: SchedulerSettings,
    pub late_runs: LateRunsSettings,
    pub pause_expirations: PauseExpirationsSettings,
    pub cancellation_cleanup: CancellationCleanupSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub loop_seconds: u64,
    pub deployment_batch_size: usize,
    pub insert_batch_size: usize,
    pub max_concurrency: usize,
    pub min_runs: usize,
    pub max_runs: usize,
    pub min_scheduled_time_seconds: u64,
    pub max_scheduled_time_seconds: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_seconds: 60,
            deployment_batch_size: 100,
            insert_batch_size: 500,
            max_concurrency: 10,
            min_runs: 3,
            max_runs: 100,
            min_scheduled_time_seconds: 60 * 60,
            max_scheduled_time_seconds: 100 * 24 * 60 * 60,
        }
    }
}

impl SchedulerSettings {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_seconds)
    }

    pub fn min_scheduled_time(&self) -> Duration {
        Duration::from_secs(self.min_scheduled_time_seconds)
    }

    pub fn max_scheduled_time(&self) -> Duration {
        Duration::from_secs(self.max_scheduled_time_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LateRunsSettings {
    pub enabled: bool,
    pub loop_seconds: u64,
    /// How far past its scheduled time a run may be before it is marked Late.
    pub after_seconds: u64,
    pub batch_size: usize,
}

impl Default for LateRunsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_seconds: 5,
            after_seconds: 15,
            batch_size: 400,
        }
    }
}

impl LateRunsSettings {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_seconds)
    }

    pub fn after(&self) -> Duration {
        Duration::from_secs(self.after_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PauseExpirationsSettings {
    pub enabled: bool,
    pub loop_seconds: u64,
    pub batch_size: usize,
}

impl Default for PauseExpirationsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_seconds: 5,
            batch_size: 200,
        }
    }
}

impl PauseExpirationsSettings {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationCleanupSettings {
    pub enabled: bool,
    pub loop_seconds: u64,
    pub batch_size: usize,
    pub lookback_seconds: u64,
}

impl Default for CancellationCleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_seconds: 20,
            batch_size: 200,
            lookback_seconds: 24 * 60 * 60,
        }
    }
}

impl CancellationCleanupSettings {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_seconds)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_seconds)
    }
}

/// Settings after overrides and validation, with paths expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub home: PathBuf,
    pub store_path: PathBuf,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub services: ServicesSettings,
}

// ── Loading ────────────────────────────────────────────────────

impl Settings {
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Apply every `FLOWGRID_*` variable of the process environment.
    pub fn apply_process_env(&mut self) -> ConfigResult<Vec<String>> {
        self.apply_env(std::env::vars())
    }

    /// Apply `FLOWGRID_*` overrides from `vars`.
    ///
    /// Returns the prefixed keys that matched no setting. Variables without
    /// the prefix are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> ConfigResult<Vec<String>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut unknown = Vec::new();
        for (key, value) in vars {
            let key = key.as_ref();
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if !self.set(name, value.as_ref()).map_err(|reason| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: value.as_ref().to_string(),
                reason,
            })? {
                unknown.push(key.to_string());
            }
        }
        Ok(unknown)
    }

    fn set(&mut self, name: &str, value: &str) -> Result<bool, String> {
        let scheduler = &mut self.services.scheduler;
        let late = &mut self.services.late_runs;
        let pause = &mut self.services.pause_expirations;
        let cleanup = &mut self.services.cancellation_cleanup;

        match name {
            "HOME" => self.home = value.to_string(),
            "LOGGING_LEVEL" => self.logging.level = value.to_string(),
            "LOGGING_FORMAT" => self.logging.format = value.parse()?,
            "STORE_PATH" => self.store.path = value.to_string(),
            "STORE_RETRY_ATTEMPTS" => self.store.retry_attempts = parse(value)?,
            "STORE_RETRY_BASE_DELAY_MS" => self.store.retry_base_delay_ms = parse(value)?,

            "SERVICES_SCHEDULER_ENABLED" => scheduler.enabled = parse_bool(value)?,
            "SERVICES_SCHEDULER_LOOP_SECONDS" => scheduler.loop_seconds = parse(value)?,
            "SERVICES_SCHEDULER_DEPLOYMENT_BATCH_SIZE" => {
                scheduler.deployment_batch_size = parse(value)?
            }
            "SERVICES_SCHEDULER_INSERT_BATCH_SIZE" => scheduler.insert_batch_size = parse(value)?,
            "SERVICES_SCHEDULER_MAX_CONCURRENCY" => scheduler.max_concurrency = parse(value)?,
            "SERVICES_SCHEDULER_MIN_RUNS" => scheduler.min_runs = parse(value)?,
            "SERVICES_SCHEDULER_MAX_RUNS" => scheduler.max_runs = parse(value)?,
            "SERVICES_SCHEDULER_MIN_SCHEDULED_TIME_SECONDS" => {
                scheduler.min_scheduled_time_seconds = parse(value)?
            }
            "SERVICES_SCHEDULER_MAX_SCHEDULED_TIME_SECONDS" => {
                scheduler.max_scheduled_time_seconds = parse(value)?
            }

            "SERVICES_LATE_RUNS_ENABLED" => late.enabled = parse_bool(value)?,
            "SERVICES_LATE_RUNS_LOOP_SECONDS" => late.loop_seconds = parse(value)?,
            "SERVICES_LATE_RUNS_AFTER_SECONDS" => late.after_seconds = parse(value)?,
            "SERVICES_LATE_RUNS_BATCH_SIZE" => late.batch_size = parse(value)?,

            "SERVICES_PAUSE_EXPIRATIONS_ENABLED" => pause.enabled = parse_bool(value)?,
            "SERVICES_PAUSE_EXPIRATIONS_LOOP_SECONDS" => pause.loop_seconds = parse(value)?,
            "SERVICES_PAUSE_EXPIRATIONS_BATCH_SIZE" => pause.batch_size = parse(value)?,

            "SERVICES_CANCELLATION_CLEANUP_ENABLED" => cleanup.enabled = parse_bool(value)?,
            "SERVICES_CANCELLATION_CLEANUP_LOOP_SECONDS" => cleanup.loop_seconds = parse(value)?,
            "SERVICES_CANCELLATION_CLEANUP_BATCH_SIZE" => cleanup.batch_size = parse(value)?,
            "SERVICES_CANCELLATION_CLEANUP_LOOKBACK_SECONDS" => {
                cleanup.lookback_seconds = parse(value)?
            }

            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn parse<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| e.to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got `{other}`")),
    }
}

// ── Resolution ─────────────────────────────────────────────────

impl Settings {
    /// Expand paths and validate. `user_home` replaces a leading `~`.
    pub fn resolve(self, user_home: Option<&Path>) -> ConfigResult<ResolvedSettings> {
        self.validate()?;

        let home = expand_tilde(&self.home, user_home)?;
        let home_str = home.to_string_lossy();
        let store_path = expand_tilde(&self.store.path.replace(HOME_TEMPLATE, &home_str), user_home)?;

        Ok(ResolvedSettings {
            home,
            store_path,
            logging: self.logging,
            store: self.store,
            services: self.services,
        })
    }

    fn validate(&self) -> ConfigResult<()> {
        let scheduler = &self.services.scheduler;
        let positive: [(&'static str, u64); 13] = [
            ("store.retry_attempts", self.store.retry_attempts.into()),
            ("services.scheduler.loop_seconds", scheduler.loop_seconds),
            (
                "services.scheduler.deployment_batch_size",
                scheduler.deployment_batch_size as u64,
            ),
            (
                "services.scheduler.insert_batch_size",
                scheduler.insert_batch_size as u64,
            ),
            (
                "services.scheduler.max_concurrency",
                scheduler.max_concurrency as u64,
            ),
            (
                "services.late_runs.loop_seconds",
                self.services.late_runs.loop_seconds,
            ),
            (
                "services.late_runs.batch_size",
                self.services.late_runs.batch_size as u64,
            ),
            (
                "services.pause_expirations.loop_seconds",
                self.services.pause_expirations.loop_seconds,
            ),
            (
                "services.pause_expirations.batch_size",
                self.services.pause_expirations.batch_size as u64,
            ),
            (
                "services.cancellation_cleanup.loop_seconds",
                self.services.cancellation_cleanup.loop_seconds,
            ),
            (
                "services.cancellation_cleanup.batch_size",
                self.services.cancellation_cleanup.batch_size as u64,
            ),
            ("services.scheduler.max_runs", scheduler.max_runs as u64),
            (
                "services.scheduler.max_scheduled_time_seconds",
                scheduler.max_scheduled_time_seconds,
            ),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".into(),
                });
            }
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "logging.level",
                reason: "must not be empty".into(),
            });
        }
        if self.store.path.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "store.path",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

fn expand_tilde(path: &str, user_home: Option<&Path>) -> ConfigResult<PathBuf> {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(path)),
    };
    let base = user_home.ok_or_else(|| ConfigError::Invalid {
        key: "home",
        reason: format!("cannot expand `{path}` without a user home directory"),
    })?;
    Ok(if rest.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rest)
    })
}
