//! Configuration management for the save tracker.
//!
//! Loads configuration from a TOML file and provides runtime defaults.
//! Command line flags are layered on top by the binary.

use crate::attachment::AttachLogPolicy;
use crate::naming::NamingTemplate;
use crate::types::{BackupError, ImageSize, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{warn, Level};

/// Name of the scratch file used to prove the backup directory is writable
const WRITE_CHECK_FILE: &str = ".save-tracker-write-check";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Directory the game writes its saves to
    #[serde(default = "default_watch_path")]
    pub watch_path: PathBuf,

    /// Glob selecting save files inside `watch_path`
    #[serde(default = "default_watch_pattern")]
    pub watch_pattern: String,

    /// Backup directory; `<watch_path>/Backup` when unset
    #[serde(default)]
    pub backup_path: Option<PathBuf>,

    /// Backup naming template
    #[serde(default = "default_naming_format")]
    pub naming_format: String,

    /// Executable name of the game
    #[serde(default = "default_process_name")]
    pub process_name: String,

    /// Screenshot size as `WIDTHxHEIGHT`; native size when unset
    #[serde(default)]
    pub image_size: Option<ImageSize>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            watch_path: default_watch_path(),
            watch_pattern: default_watch_pattern(),
            backup_path: None,
            naming_format: default_naming_format(),
            process_name: default_process_name(),
            image_size: None,
        }
    }
}

impl TrackingConfig {
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_path
            .clone()
            .unwrap_or_else(|| self.watch_path.join("Backup"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay before reading a notified save
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Attachment loop interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound for a single screenshot
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,

    /// Upper bound for draining work and stopping the attachment loop
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            poll_interval_ms: default_poll_interval(),
            capture_timeout_ms: default_capture_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Level for "game not running yet" attach results
    #[serde(default = "default_not_found_level")]
    pub attach_not_found_level: String,

    /// Level for any other attach failure
    #[serde(default = "default_failure_level")]
    pub attach_failure_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            attach_not_found_level: default_not_found_level(),
            attach_failure_level: default_failure_level(),
        }
    }
}

impl LoggingConfig {
    pub fn attach_log_policy(&self) -> Result<AttachLogPolicy> {
        Ok(AttachLogPolicy {
            not_found: parse_level(&self.attach_not_found_level)?,
            failure: parse_level(&self.attach_failure_level)?,
        })
    }
}

fn parse_level(value: &str) -> Result<Level> {
    Level::from_str(value.trim())
        .map_err(|_| BackupError::Config(format!("unknown log level '{}'", value)))
}

// Default value functions for serde
fn default_watch_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("HellbladeGame")
        .join("Saved")
        .join("SaveGames")
}

fn default_watch_pattern() -> String {
    "*.sav".to_string()
}

fn default_naming_format() -> String {
    "save_{time}_{seq:03}_{hash}".to_string()
}

fn default_process_name() -> String {
    "HellbladeGame-Win64-Shipping".to_string()
}

fn default_debounce() -> u64 {
    100
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_capture_timeout() -> u64 {
    2000
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_not_found_level() -> String {
    "trace".to_string()
}

fn default_failure_level() -> String {
    "error".to_string()
}

/// Where the effective configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at this path; built-in defaults apply
    Defaults(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults(path) => write!(f, "defaults (no file at {})", path.display()),
        }
    }
}

impl Config {
    /// Load configuration from a specific path.
    ///
    /// A missing file yields defaults. A file that exists but does not parse
    /// is an error rather than a silent fallback.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        Self::load_with_source(path).map(|(config, _)| config)
    }

    /// Like [`Config::load_from_path`], also reporting whether a file was read.
    ///
    /// Nothing is logged here since this usually runs before the subscriber
    /// exists; callers log the returned [`ConfigSource`] once it does.
    pub fn load_with_source(path: &Path) -> Result<(Self, ConfigSource)> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((Self::default(), ConfigSource::Defaults(path.to_path_buf())));
            }
            Err(e) => {
                return Err(BackupError::Config(format!("cannot read {}: {}", path.display(), e)));
            }
        };

        let config = toml::from_str(&contents)
            .map_err(|e| BackupError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok((config, ConfigSource::File(path.to_path_buf())))
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("save-tracker")
            .join("config.toml")
    }

    /// Check everything that must hold before tracking starts.
    ///
    /// Creates the backup directory if needed. Returns the parsed naming template.
    pub fn validate(&self) -> Result<NamingTemplate> {
        let tracking = &self.tracking;

        if !tracking.watch_path.is_dir() {
            return Err(BackupError::Config(format!(
                "watch directory {} does not exist",
                tracking.watch_path.display()
            )));
        }

        crate::watcher::compile_pattern(&tracking.watch_pattern)?;

        let template = NamingTemplate::parse(&tracking.naming_format)?;
        if !template.has_sequence() {
            warn!(
                "Naming format '{}' has no {{seq}} placeholder; collisions are only resolved by time and hash",
                template.as_str()
            );
        }

        self.logging.attach_log_policy()?;
        parse_level(&self.logging.level)?;

        if self.timing.poll_interval_ms == 0 {
            return Err(BackupError::Config("poll_interval_ms must be positive".to_string()));
        }

        ensure_writable_dir(&tracking.backup_dir())?;
        Ok(template)
    }
}

/// Create `dir` if missing and prove it accepts new files
fn ensure_writable_dir(dir: &Path) -> Result<()> {
    let unwritable = |e: io::Error| {
        BackupError::Config(format!("backup directory {} is not writable: {}", dir.display(), e))
    };

    fs::create_dir_all(dir).map_err(unwritable)?;

    let marker = dir.join(WRITE_CHECK_FILE);
    let written = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&marker)
        .and_then(|mut f| f.write_all(b"ok"));
    let _ = fs::remove_file(&marker);

    written.map_err(unwritable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(watch: &Path, backup: &Path) -> Config {
        let mut config = Config::default();
        config.tracking.watch_path = watch.to_path_buf();
        config.tracking.backup_path = Some(backup.to_path_buf());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tracking.watch_pattern, "*.sav");
        assert_eq!(config.tracking.process_name, "HellbladeGame-Win64-Shipping");
        assert!(config.tracking.watch_path.ends_with("HellbladeGame/Saved/SaveGames"));
        assert_eq!(config.tracking.backup_dir(), config.tracking.watch_path.join("Backup"));
        assert_eq!(config.timing.debounce(), Duration::from_millis(100));
        assert_eq!(config.timing.capture_timeout(), Duration::from_secs(2));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[tracking]
watch_path = "/games/saves"
naming_format = "hb_{seq:04}"
image_size = "1280x720"

[timing]
debounce_ms = 0

[logging]
attach_not_found_level = "debug"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tracking.watch_path, PathBuf::from("/games/saves"));
        assert_eq!(config.tracking.backup_dir(), PathBuf::from("/games/saves/Backup"));
        assert_eq!(config.tracking.naming_format, "hb_{seq:04}");
        assert_eq!(config.tracking.image_size, Some(ImageSize::new(1280, 720)));
        assert_eq!(config.tracking.watch_pattern, "*.sav");
        assert_eq!(config.timing.debounce(), Duration::ZERO);
        assert_eq!(config.timing.poll_interval_ms, 1000);

        let policy = config.logging.attach_log_policy().unwrap();
        assert_eq!(policy.not_found, Level::DEBUG);
        assert_eq!(policy.failure, Level::ERROR);
    }

    #[test]
    fn test_bad_image_size_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("[tracking]\nimage_size = \"wide\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_source_reports_missing_file_as_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let (config, source) = Config::load_with_source(&path).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(source, ConfigSource::Defaults(path.clone()));
        assert!(source.to_string().starts_with("defaults"));
    }

    #[test]
    fn test_source_reports_file_that_was_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[tracking]\nprocess_name = \"Game\"\n").unwrap();

        let (config, source) = Config::load_with_source(&path).unwrap();

        assert_eq!(config.tracking.process_name, "Game");
        assert_eq!(source, ConfigSource::File(path.clone()));
        assert_eq!(source.to_string(), path.display().to_string());
    }

    #[test]
    fn test_unparsable_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[tracking\nwatch_path = ").unwrap();

        assert!(matches!(Config::load_from_path(&path), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.tracking.image_size = Some(ImageSize::new(640, 360));
        fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(Config::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_creates_backup_dir() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("nested").join("Backup");
        let config = config_for(dir.path(), &backup);

        let template = config.validate().unwrap();

        assert!(backup.is_dir());
        assert!(!backup.join(WRITE_CHECK_FILE).exists());
        assert!(template.has_sequence());
    }

    #[test]
    fn test_validate_rejects_missing_watch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir.path().join("missing"), &dir.path().join("backup"));

        assert!(matches!(config.validate(), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_backup_path_that_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("backup");
        fs::write(&blocker, b"not a directory").unwrap();
        let config = config_for(dir.path(), &blocker);

        assert!(matches!(config.validate(), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path(), &dir.path().join("backup"));
        config.tracking.naming_format = "save_{bogus}".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path(), &dir.path().join("backup"));
        config.logging.attach_failure_level = "loud".to_string();

        assert!(matches!(config.validate(), Err(BackupError::Config(_))));
    }
}
