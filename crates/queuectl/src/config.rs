use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Process-level runtime configuration: where things live on disk and how the
/// binaries behave. Loaded from the environment (and `.env`, if present).
#[derive(Clone, Debug)]
pub struct Config {
    pub home: PathBuf,
    pub database_path: PathBuf,
    pub settings_path: PathBuf,
    pub registry_path: PathBuf,
    pub log_dir: PathBuf,
    pub worker_bin: Option<PathBuf>,
    pub stop_grace: Duration,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let home = match env_or_fallback("QUEUECTL_HOME", "QUEUECTL_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .map(|h| h.join(".queuectl"))
                .ok_or_else(|| QueueError::Config("cannot resolve home directory".into()))?,
        };

        let mut cfg = Self::with_home(home);

        if let Some(db) = env_or_fallback("QUEUECTL_DB_PATH", "DATABASE_PATH") {
            cfg.database_path = PathBuf::from(db);
        }

        cfg.worker_bin = env_or_fallback("QUEUECTL_WORKER_BIN", "WORKER_BIN").map(PathBuf::from);

        cfg.stop_grace = env_or_fallback("QUEUECTL_STOP_GRACE_SECS", "STOP_GRACE_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(cfg.stop_grace);

        cfg.log_format = env_or_fallback("QUEUECTL_LOG_FORMAT", "LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Ok(cfg)
    }

    /// Layout rooted at `home`, everything else at its defaults.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            database_path: home.join("jobs.db"),
            settings_path: home.join("config.json"),
            registry_path: home.join("workers.json"),
            log_dir: home.join("logs"),
            home,
            worker_bin: None,
            stop_grace: Duration::from_secs(30),
            log_format: LogFormat::default(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.home)?;
        std::fs::create_dir_all(&self.log_dir)?;
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// The executable the supervisor launches for each worker. Defaults to the
    /// `queuectl-worker` binary installed next to the running executable.
    pub fn worker_program(&self) -> Result<PathBuf> {
        if let Some(bin) = &self.worker_bin {
            return Ok(bin.clone());
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| QueueError::Config("current executable has no parent dir".into()))?;
        Ok(dir.join(format!("queuectl-worker{}", std::env::consts::EXE_SUFFIX)))
    }

    pub fn settings_store(&self) -> SettingsStore {
        SettingsStore::new(&self.settings_path)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" | "plain" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(QueueError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

// ----------------------------
// Engine settings (config.json)
// ----------------------------

/// The engine's tunables. Read once at pool start and on every enqueue;
/// the engine never writes them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_retries: i64,
    pub backoff_base: i64,
    /// Seconds between unsuccessful claim attempts.
    pub poll_interval: f64,
    /// Seconds a job may run when the submission does not say otherwise.
    pub default_timeout: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            poll_interval: 1.0,
            default_timeout: 10,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries < 0 {
            return Err(QueueError::Config("max_retries must be >= 0".into()));
        }
        if self.backoff_base < 1 {
            return Err(QueueError::Config("backoff_base must be >= 1".into()));
        }
        if !(self.poll_interval.is_finite() && self.poll_interval > 0.0) {
            return Err(QueueError::Config("poll_interval must be > 0".into()));
        }
        if self.default_timeout <= 0 {
            return Err(QueueError::Config("default_timeout must be > 0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    pub fn get(&self, key: SettingKey) -> String {
        match key {
            SettingKey::MaxRetries => self.max_retries.to_string(),
            SettingKey::BackoffBase => self.backoff_base.to_string(),
            SettingKey::PollInterval => self.poll_interval.to_string(),
            SettingKey::DefaultTimeout => self.default_timeout.to_string(),
        }
    }

    /// Parse `value` for `key` and apply it. The result is validated as a whole.
    pub fn set(&mut self, key: SettingKey, value: &str) -> Result<()> {
        let invalid = || QueueError::Config(format!("invalid value for {key}: '{value}'"));
        let value = value.trim();

        let mut next = self.clone();
        match key {
            SettingKey::MaxRetries => next.max_retries = value.parse().map_err(|_| invalid())?,
            SettingKey::BackoffBase => next.backoff_base = value.parse().map_err(|_| invalid())?,
            SettingKey::PollInterval => next.poll_interval = value.parse().map_err(|_| invalid())?,
            SettingKey::DefaultTimeout => {
                next.default_timeout = value.parse().map_err(|_| invalid())?
            }
        }
        next.validate()?;

        *self = next;
        Ok(())
    }

    pub fn entries(&self) -> Vec<(SettingKey, String)> {
        SettingKey::ALL.iter().map(|k| (*k, self.get(*k))).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKey {
    MaxRetries,
    BackoffBase,
    PollInterval,
    DefaultTimeout,
}

impl SettingKey {
    pub const ALL: [SettingKey; 4] = [
        SettingKey::MaxRetries,
        SettingKey::BackoffBase,
        SettingKey::PollInterval,
        SettingKey::DefaultTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::MaxRetries => "max_retries",
            SettingKey::BackoffBase => "backoff_base",
            SettingKey::PollInterval => "poll_interval",
            SettingKey::DefaultTimeout => "default_timeout",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = QueueError;

    // accepts both `max-retries` and `max_retries`
    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_lowercase().replace('-', "_");
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str() == key)
            .ok_or_else(|| QueueError::Config(format!("unknown config key '{s}'")))
    }
}

/// JSON-file backed key/value store for [`Settings`].
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means defaults. A file that exists but cannot be parsed
    /// is an error rather than a silent reset.
    pub fn load(&self) -> Result<Settings> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => return Err(e.into()),
        };

        let settings: Settings = serde_json::from_str(&raw).map_err(|e| {
            QueueError::Config(format!("{} is not valid: {e}", self.path.display()))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<String> {
        let key: SettingKey = key.parse()?;
        Ok(self.load()?.get(key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<Settings> {
        let key: SettingKey = key.parse()?;
        let mut settings = self.load()?;
        settings.set(key, value)?;
        self.save(&settings)?;
        Ok(settings)
    }
}
