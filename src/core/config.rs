//! Configuration module for the camera exporter
//!
//! Supports loading configuration from a TOML file.
//! Configuration is stored in a standard location:
//! - Windows: %APPDATA%\cam_export\config.toml
//! - Linux/macOS: ~/.config/cam_export/config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name used for config directory
const APP_NAME: &str = "cam_export";

/// Default config file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Address the camera's Wi-Fi access point hands itself
pub const DEFAULT_CAMERA_HOST: &str = "192.168.42.1";

/// Get the standard configuration directory for the application.
pub fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|appdata| PathBuf::from(appdata).join(APP_NAME))
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".config").join(APP_NAME))
    }
}

/// Get the standard configuration file path.
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Token-scoped JSON control channel
    pub control: ControlConfig,

    /// Shell channel used to launch the file-transfer daemon
    pub shell: ShellConfig,

    /// File-transfer daemon and its session credentials
    pub ftp: FtpConfig,

    /// Local destination storage
    pub storage: StorageConfig,

    /// Poll loop timing
    pub export: ExportConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Export ledger settings
    pub tracking: TrackingConfig,
}

/// Control channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    /// Dial timeout in seconds
    pub connect_timeout_secs: u64,
    /// Upper bound for one request/response exchange in seconds
    pub io_timeout_secs: u64,
}

/// Shell (bootstrap) channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub host: String,
    pub port: u16,
    /// Username line sent after the banner
    pub user: String,
    /// Dial timeout in seconds
    pub connect_timeout_secs: u64,
    /// How long to wait for banner/echo output before moving on, in milliseconds
    pub banner_timeout_ms: u64,
    /// Fixed pause between banner and login line, in milliseconds
    pub login_delay_ms: u64,
    /// Overall budget for the daemon to start accepting connections, in seconds
    pub readiness_timeout_secs: u64,
}

/// File-transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Root directory the daemon serves (camera media directory)
    pub root_dir: String,
    /// Dial timeout in seconds
    pub connect_timeout_secs: u64,
    /// Upper bound for a single reply or data read, in seconds
    pub io_timeout_secs: u64,
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Destination root for exported files
    pub directory: PathBuf,

    /// Keep the camera's directory (e.g. `100MEDIA/`) under the root
    pub preserve_structure: bool,

    /// Refuse to start a cycle when less than this many bytes are free (0 = off)
    pub min_free_bytes: u64,
}

/// Poll loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Delay before retrying after a failed cycle, in seconds
    pub survey_interval_secs: u64,

    /// Delay before polling again after a successful cycle, in seconds
    pub idle_interval_secs: u64,

    /// Per-channel bound on teardown at the end of a cycle, in seconds
    pub teardown_timeout_secs: u64,

    /// How long the process waits for the loop after a termination signal, in seconds
    pub shutdown_grace_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Also write log lines to a file
    pub log_to_file: bool,

    /// Log file path
    pub log_file: PathBuf,
}

/// Export ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Enable the export ledger
    pub enabled: bool,

    /// Ledger file name, created in the storage root
    pub tracking_filename: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_CAMERA_HOST.to_string(),
            port: 7878,
            connect_timeout_secs: 5,
            io_timeout_secs: 10,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_CAMERA_HOST.to_string(),
            port: 23,
            user: "root".to_string(),
            connect_timeout_secs: 5,
            banner_timeout_ms: 1000,
            login_delay_ms: 1000,
            readiness_timeout_secs: 10,
        }
    }
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_CAMERA_HOST.to_string(),
            port: 21,
            user: "root".to_string(),
            password: String::new(),
            root_dir: "/tmp/SD0/DCIM".to_string(),
            connect_timeout_secs: 5,
            io_timeout_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let directory = dirs::video_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join(APP_NAME))
            .unwrap_or_else(|| PathBuf::from("./exported"));

        Self {
            directory,
            preserve_structure: false,
            min_free_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            survey_interval_secs: 60,
            idle_interval_secs: 300,
            teardown_timeout_secs: 5,
            shutdown_grace_secs: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: PathBuf::from("./cam_export.log"),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracking_filename: ".cam_export_state.json".to_string(),
        }
    }
}

impl ControlConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl ShellConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }

    pub fn login_delay(&self) -> Duration {
        Duration::from_millis(self.login_delay_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

impl FtpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl ExportConfig {
    pub fn survey_interval(&self) -> Duration {
        Duration::from_secs(self.survey_interval_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Point every channel at the same camera address
    pub fn set_camera_host(&mut self, host: &str) {
        self.control.host = host.to_string();
        self.shell.host = host.to_string();
        self.ftp.host = host.to_string();
    }

    /// Check the values the exporter cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoints = [
            ("control", &self.control.host, self.control.port),
            ("shell", &self.shell.host, self.shell.port),
            ("ftp", &self.ftp.host, self.ftp.port),
        ];

        for (section, host, port) in endpoints {
            if host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("[{}] host is empty", section)));
            }
            if port == 0 {
                return Err(ConfigError::Invalid(format!("[{}] port is 0", section)));
            }
        }

        if self.ftp.root_dir.trim().is_empty() {
            return Err(ConfigError::Invalid("[ftp] root_dir is empty".to_string()));
        }

        if self.storage.directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "[storage] directory is empty".to_string(),
            ));
        }

        if self.export.survey_interval_secs == 0 || self.export.idle_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "[export] intervals must be at least one second".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;

        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./cam_export.toml
    /// 2. ./config.toml
    /// 3. Standard config location
    ///
    /// If no config file is found, returns default configuration.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Self::get_active_config_path()).or_else(|e| match e {
            ConfigError::FileNotFound(_) => Ok(Self::default()),
            other => Err(other),
        })
    }

    /// Get the path where the config file is (or would be) located.
    pub fn get_active_config_path() -> PathBuf {
        let local_paths = [
            PathBuf::from("./cam_export.toml"),
            PathBuf::from("./config.toml"),
        ];

        for path in &local_paths {
            if path.exists() {
                return path.clone();
            }
        }

        get_config_path().unwrap_or_else(|| PathBuf::from("./config.toml"))
    }

    /// Generate a default config file with comments
    pub fn generate_default_config() -> String {
        include_str!("../../config.example.toml").to_string()
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file was not found at the specified path
    FileNotFound(PathBuf),
    /// Failed to read the configuration file
    ReadError(PathBuf, String),
    /// Failed to parse the configuration file (invalid TOML)
    ParseError(PathBuf, String),
    /// A value is present but unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            ConfigError::ReadError(path, err) => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::ParseError(path, err) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_follow_camera() {
        let config = Config::default();
        assert_eq!(config.control.host, DEFAULT_CAMERA_HOST);
        assert_eq!(config.control.port, 7878);
        assert_eq!(config.shell.port, 23);
        assert_eq!(config.ftp.port, 21);
        assert_eq!(config.ftp.root_dir, "/tmp/SD0/DCIM");
        assert_eq!(config.export.survey_interval(), Duration::from_secs(60));
        assert_eq!(config.export.idle_interval(), Duration::from_secs(300));
        assert_eq!(config.export.shutdown_grace(), Duration::from_secs(3));
        assert!(!config.storage.preserve_structure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [ftp]
            password = "secret"

            [storage]
            directory = "/srv/camera"
            min_free_bytes = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.ftp.password, "secret");
        assert_eq!(config.ftp.user, "root");
        assert_eq!(config.storage.directory, PathBuf::from("/srv/camera"));
        assert_eq!(config.storage.min_free_bytes, 0);
        assert_eq!(config.control.port, 7878);
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut config = Config::default();
        config.shell.host = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[shell] host"));
    }

    #[test]
    fn test_validate_rejects_zero_port_and_interval() {
        let mut config = Config::default();
        config.ftp.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.export.idle_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_camera_host() {
        let mut config = Config::default();
        config.set_camera_host("10.0.0.7");
        assert_eq!(config.control.host, "10.0.0.7");
        assert_eq!(config.shell.host, "10.0.0.7");
        assert_eq!(config.ftp.host, "10.0.0.7");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/cam_export.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "[control\nport = ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_, _)));
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(&Config::generate_default_config()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.control.port, 7878);
    }
}
