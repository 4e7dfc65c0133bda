//! mtuned Configuration
//!
//! Parses the daemon's INI configuration file: database credentials, the
//! persistent tune target, per-parameter tuning intervals and the
//! notification transports.

use std::path::Path;

use ini::{Ini, Properties};

use crate::error::{Error, Result};
use crate::util;

/// Default SMTP submission port
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Default log file path
pub const DEFAULT_LOG_FILE: &str = "/var/log/mtuned.log";

/// How often notifications for the same subject may be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyFrequency {
    /// Notifications disabled
    Never,
    /// Same-subject resends suppressed for 24 hours
    Daily,
    /// No suppression
    Immediately,
}

/// The operator's storage hint from the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePreference {
    /// Probe the device with smartctl
    AutoDetect,
    Spinning,
    Ssd,
}

/// Resolved storage media class of the data device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Unknown,
    Spinning,
    Ssd,
}

/// Main mtuned configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database user
    pub username: String,

    /// Database password
    pub password: String,

    /// Unix socket path (preferred over hostname when set)
    pub socket: String,

    /// Hostname, optionally `host:port` (default port 3306)
    pub hostname: String,

    /// Path of the INI fragment that mirrors applied changes; empty
    /// disables persistence
    pub persistent_tune: String,

    /// Permit invasive host-level changes
    pub bold: bool,

    pub notify_frequency: NotifyFrequency,

    /// Log file path; empty means the default
    pub log: String,

    /// Log level: -1 debug, 0 info, 1 warn, >=2 error
    pub log_level: i64,

    pub ssd: StoragePreference,

    /// Per-parameter tuning periods in seconds (0 = default)
    pub interval: TuneIntervals,

    pub notify: NotifyConfig,
}

/// Per-parameter tuning periods in seconds
#[derive(Debug, Clone, Default)]
pub struct TuneIntervals {
    pub innodb_buffer_pool_size: u64,
    pub table_open_cache: u64,
    pub table_definition_cache: u64,
    pub innodb_log_file_size: u64,
    pub innodb_log_buffer_size: u64,
    pub max_connections: u64,
    pub key_buffer_size: u64,
    pub innodb_flush_neighbors: u64,
    pub innodb_buffer_pool_instances: u64,
    pub table_open_cache_instances: u64,
    pub innodb_io_capacity_max: u64,
    pub innodb_io_capacity: u64,
}

/// Notification transport configuration
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub email: String,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub slack_webhook: String,
    pub generic_webhook: String,
}

impl Config {
    /// Load configuration from an INI file
    pub fn from_file(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)?;
        Self::from_ini(&ini)
    }

    /// Load configuration from an INI string
    pub fn from_str(content: &str) -> Result<Self> {
        let ini = Ini::load_from_str(content).map_err(ini::Error::Parse)?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self> {
        let general = ini.general_section();

        let notify_frequency = match get_i64(general, "notify_frequency", 0)? {
            0 => NotifyFrequency::Never,
            1 => NotifyFrequency::Daily,
            2 => NotifyFrequency::Immediately,
            other => {
                return Err(Error::Config(format!(
                    "notify_frequency must be 0, 1 or 2, got {other}"
                )))
            }
        };

        let ssd = match get_i64(general, "ssd", -1)? {
            -1 => StoragePreference::AutoDetect,
            0 => StoragePreference::Spinning,
            1 => StoragePreference::Ssd,
            other => {
                return Err(Error::Config(format!("ssd must be -1, 0 or 1, got {other}")))
            }
        };

        let interval = match ini.section(Some("interval")) {
            Some(props) => TuneIntervals {
                innodb_buffer_pool_size: get_u64(props, "innodb_buffer_pool_size", 0)?,
                table_open_cache: get_u64(props, "table_open_cache", 0)?,
                table_definition_cache: get_u64(props, "table_definition_cache", 0)?,
                innodb_log_file_size: get_u64(props, "innodb_log_file_size", 0)?,
                innodb_log_buffer_size: get_u64(props, "innodb_log_buffer_size", 0)?,
                max_connections: get_u64(props, "max_connections", 0)?,
                key_buffer_size: get_u64(props, "key_buffer_size", 0)?,
                // Key carries a trailing underscore for compatibility with
                // existing deployments.
                innodb_flush_neighbors: get_u64(props, "innodb_flush_neighbors_", 0)?,
                innodb_buffer_pool_instances: get_u64(props, "innodb_buffer_pool_instances", 0)?,
                table_open_cache_instances: get_u64(props, "table_open_cache_instances", 0)?,
                innodb_io_capacity_max: get_u64(props, "innodb_io_capacity_max", 0)?,
                innodb_io_capacity: get_u64(props, "innodb_io_capacity", 0)?,
            },
            None => TuneIntervals::default(),
        };

        let notify = match ini.section(Some("notify")) {
            Some(props) => NotifyConfig {
                email: get_string(props, "email"),
                smtp_username: get_string(props, "smtp_username"),
                smtp_password: get_string(props, "smtp_password"),
                smtp_host: get_string(props, "smtp_host"),
                smtp_port: match get_u64(props, "smtp_port", 0)? {
                    0 => DEFAULT_SMTP_PORT,
                    port => u16::try_from(port)
                        .map_err(|_| Error::Config(format!("smtp_port {port} out of range")))?,
                },
                slack_webhook: get_string(props, "slack_webhook"),
                generic_webhook: get_string(props, "generic_webhook"),
            },
            None => NotifyConfig::default(),
        };

        Ok(Config {
            username: get_string(general, "username"),
            password: get_string(general, "password"),
            socket: get_string(general, "socket"),
            hostname: get_string(general, "hostname"),
            persistent_tune: get_string(general, "persistent_tune"),
            bold: get_bool(general, "bold"),
            notify_frequency,
            log: get_string(general, "log"),
            log_level: get_i64(general, "log_level", 0)?,
            ssd,
            interval,
            notify,
        })
    }

    /// Hostname part of the TCP address
    pub fn db_host(&self) -> &str {
        match self.hostname.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.hostname,
        }
    }

    /// Port part of the TCP address, defaulting to 3306
    pub fn db_port(&self) -> u16 {
        self.hostname
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(3306)
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_host: String::new(),
            smtp_port: DEFAULT_SMTP_PORT,
            slack_webhook: String::new(),
            generic_webhook: String::new(),
        }
    }
}

fn get_string(props: &Properties, key: &str) -> String {
    props.get(key).unwrap_or_default().to_string()
}

fn get_bool(props: &Properties, key: &str) -> bool {
    props.get(key).and_then(util::parse_bool).unwrap_or(false)
}

fn get_i64(props: &Properties, key: &str, default: i64) -> Result<i64> {
    match props.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} must be an integer, got {raw:?}"))),
        None => Ok(default),
    }
}

fn get_u64(props: &Properties, key: &str, default: u64) -> Result<u64> {
    match props.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            Error::Config(format!("{key} must be a non-negative integer, got {raw:?}"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let content = r#"
username = mtuned
password = secret
socket = /var/run/mysqld/mysqld.sock
hostname = db.example.com:3307
persistent_tune = /etc/mysql/conf.d/mtuned.cnf
bold = true
notify_frequency = 1
log_level = -1
ssd = -1

[interval]
innodb_buffer_pool_size = 120
innodb_flush_neighbors_ = 30

[notify]
email = dba@example.com
smtp_username = mtuned@example.com
smtp_password = hunter2
smtp_host = smtp.example.com
"#;

        let config = Config::from_str(content).unwrap();
        assert_eq!(config.username, "mtuned");
        assert_eq!(config.db_host(), "db.example.com");
        assert_eq!(config.db_port(), 3307);
        assert!(config.bold);
        assert_eq!(config.notify_frequency, NotifyFrequency::Daily);
        assert_eq!(config.ssd, StoragePreference::AutoDetect);
        assert_eq!(config.interval.innodb_buffer_pool_size, 120);
        assert_eq!(config.interval.innodb_flush_neighbors, 30);
        assert_eq!(config.interval.max_connections, 0);
        assert_eq!(config.notify.smtp_port, DEFAULT_SMTP_PORT);
        assert_eq!(config.notify.email, "dba@example.com");
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_str("username = root\n").unwrap();
        assert_eq!(config.notify_frequency, NotifyFrequency::Never);
        assert_eq!(config.ssd, StoragePreference::AutoDetect);
        assert!(!config.bold);
        assert!(config.persistent_tune.is_empty());
        assert_eq!(config.db_port(), 3306);
    }

    #[test]
    fn test_rejects_bad_frequency() {
        assert!(Config::from_str("notify_frequency = 9\n").is_err());
    }
}
