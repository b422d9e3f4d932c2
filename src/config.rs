use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Trigger burst settings
    #[serde(default)]
    pub triggers: TriggerConfig,

    /// Liveness watchdog periods
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Background execution lease settings
    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub snooze: SnoozeConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TriggerConfig {
    /// Number of triggers scheduled per alarm occurrence
    #[serde(default = "default_burst_len")]
    pub burst_len: u32,

    /// Seconds between consecutive triggers of a burst
    #[serde(default = "default_trigger_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchdogConfig {
    /// Short-period liveness probe
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Long-period unconditional player restart
    #[serde(default = "default_restart_interval")]
    pub restart_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LeaseConfig {
    /// Length of each background execution grant
    #[serde(default = "default_lease_duration")]
    pub duration_secs: u64,

    /// How early before the deadline the expiry notice fires
    #[serde(default = "default_lease_margin")]
    pub expiry_margin_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaybackConfig {
    /// Directory holding `<name>.wav` alarm sounds (defaults to `<data_dir>/sounds`)
    #[serde(default)]
    pub sounds_dir: Option<String>,

    /// Fallback order when the requested sound is not available
    #[serde(default = "default_preferred_sounds")]
    pub preferred_sounds: Vec<String>,

    /// Period of the last-resort beep when no player can be created
    #[serde(default = "default_beep_interval")]
    pub beep_interval_ms: u64,

    /// Output volume (0.0 - 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,

    /// Preferred output device name (substring match, e.g. "speaker").
    /// Falls back to the default device when no match is found.
    #[serde(default)]
    pub output_device: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnoozeConfig {
    /// Delay before a snoozed alarm rings again
    #[serde(default = "default_snooze_minutes")]
    pub minutes: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationConfig {
    /// Show desktop notifications for delivered triggers
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write a daily rolling log file to the data directory
    #[serde(default = "default_true")]
    pub file: bool,
}

fn default_burst_len() -> u32 {
    20
}

fn default_trigger_interval() -> u64 {
    3
}

fn default_probe_interval() -> u64 {
    2
}

fn default_restart_interval() -> u64 {
    30
}

fn default_lease_duration() -> u64 {
    180
}

fn default_lease_margin() -> u64 {
    5
}

fn default_preferred_sounds() -> Vec<String> {
    crate::playback::sounds::DEFAULT_PREFERENCE
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_beep_interval() -> u64 {
    1500
}

fn default_volume() -> f32 {
    1.0
}

fn default_snooze_minutes() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            burst_len: default_burst_len(),
            interval_secs: default_trigger_interval(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            restart_interval_secs: default_restart_interval(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_lease_duration(),
            expiry_margin_secs: default_lease_margin(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sounds_dir: None,
            preferred_sounds: default_preferred_sounds(),
            beep_interval_ms: default_beep_interval(),
            volume: default_volume(),
            output_device: None,
        }
    }
}

impl Default for SnoozeConfig {
    fn default() -> Self {
        Self {
            minutes: default_snooze_minutes(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: true,
        }
    }
}

impl TriggerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl WatchdogConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }
}

impl LeaseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn expiry_margin(&self) -> Duration {
        Duration::from_secs(self.expiry_margin_secs)
    }
}

impl PlaybackConfig {
    pub fn beep_interval(&self) -> Duration {
        Duration::from_millis(self.beep_interval_ms)
    }

    /// Resolved sounds directory.
    pub fn sounds_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.sounds_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(Config::data_dir()?.join("sounds")),
        }
    }
}

impl SnoozeConfig {
    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.minutes))
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "reveille", "reveille")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the data directory path (alarms, state, sounds, logs)
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "reveille", "reveille")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.triggers.burst_len == 0 || self.triggers.burst_len > 64 {
            return Err(ConfigError::ValidationError(
                "burst_len must be between 1 and 64".into(),
            ));
        }

        if self.triggers.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "trigger interval_secs must be positive".into(),
            ));
        }

        if self.watchdog.probe_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "probe_interval_secs must be positive".into(),
            ));
        }

        if self.watchdog.restart_interval_secs <= self.watchdog.probe_interval_secs {
            return Err(ConfigError::ValidationError(
                "restart_interval_secs must be longer than probe_interval_secs".into(),
            ));
        }

        if self.lease.duration_secs <= self.lease.expiry_margin_secs {
            return Err(ConfigError::ValidationError(
                "lease duration_secs must exceed expiry_margin_secs".into(),
            ));
        }

        if self.playback.beep_interval_ms < 100 {
            return Err(ConfigError::ValidationError(
                "beep_interval_ms must be at least 100".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.playback.volume) {
            return Err(ConfigError::ValidationError(
                "volume must be between 0.0 and 1.0".into(),
            ));
        }

        // Sound names become file names, keep them inside the sounds dir
        for name in &self.playback.preferred_sounds {
            if name.contains("..") || name.contains('/') || name.contains('\\') {
                return Err(ConfigError::ValidationError(format!(
                    "sound name '{}' contains invalid characters",
                    name
                )));
            }
        }

        if self.snooze.minutes == 0 || self.snooze.minutes > 60 {
            return Err(ConfigError::ValidationError(
                "snooze minutes must be between 1 and 60".into(),
            ));
        }

        Ok(())
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;

        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}

/// Show current configuration
pub fn show() -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = Config::config_path()?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}
