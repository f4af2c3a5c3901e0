//! Configuration management
//!
//! Settings are resolved in this order:
//! 1. Environment variables
//! 2. `calcron.toml` configuration file
//! 3. Defaults
//!
//! `${VAR_NAME}` references inside the configuration file are expanded from
//! the environment before the file is parsed, so secrets such as the CalDAV
//! password can stay out of the file.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "calcron.toml";

/// CalDAV calendar configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalendarConfig {
    /// CalDAV server URL
    pub server_url: String,
    /// Username for authentication
    pub username: String,
    /// Password for authentication
    #[serde(skip_serializing)]
    pub password: String,
    /// Calendar path below the server URL (optional)
    #[serde(default)]
    pub calendar_id: Option<String>,
}

impl CalendarConfig {
    /// Create a new calendar config
    pub fn new(
        server_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            username: username.into(),
            password: password.into(),
            calendar_id: None,
        }
    }

    /// Set the calendar ID
    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = Some(calendar_id.into());
        self
    }
}

/// Reconciliation cycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How far ahead events are fetched
    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: u32,

    /// How far back events are fetched, so that running events with
    /// end-relative actions stay visible
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,

    /// Largest directive offset accepted; the calendar query is widened by
    /// this much on both sides
    #[serde(default = "default_max_offset_hours")]
    pub max_offset_hours: u32,

    /// Seconds between cycles in daemon mode
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// IANA zone used for floating and all-day calendar times
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Maximum number of schedule/reschedule actions in flight
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Upper bound for each call to the job scheduler
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,

    /// Check pending records against the scheduler's own job list
    #[serde(default = "default_verify_external")]
    pub verify_external: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            horizon_hours: default_horizon_hours(),
            lookback_hours: default_lookback_hours(),
            max_offset_hours: default_max_offset_hours(),
            interval_secs: default_interval_secs(),
            timezone: default_timezone(),
            parallelism: default_parallelism(),
            action_timeout_secs: default_action_timeout_secs(),
            verify_external: default_verify_external(),
        }
    }
}

impl SyncConfig {
    /// Parse the configured default timezone
    pub fn timezone(&self) -> crate::Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| Error::Config(format!("Invalid timezone '{}': {}", self.timezone, e)))
    }

    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.horizon_hours))
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.lookback_hours))
    }

    pub fn max_offset(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.max_offset_hours))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// Job record store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// How an event's command is turned into a job payload
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionConfig {
    /// Script invoked with start, end, summary, location and command as
    /// arguments instead of running the command directly
    #[serde(default)]
    pub wrapper: Option<String>,
}

/// `at` daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtConfig {
    #[serde(default = "default_at_command")]
    pub at_command: String,

    #[serde(default = "default_atrm_command")]
    pub atrm_command: String,

    #[serde(default = "default_atq_command")]
    pub atq_command: String,

    /// Dedicated `at` queue letter, keeps calcron jobs apart from others
    #[serde(default)]
    pub queue: Option<char>,
}

impl Default for AtConfig {
    fn default() -> Self {
        Self {
            at_command: default_at_command(),
            atrm_command: default_atrm_command(),
            atq_command: default_atq_command(),
            queue: None,
        }
    }
}

/// Main configuration for calcron
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub calendar: CalendarConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub action: ActionConfig,

    #[serde(default)]
    pub at: AtConfig,
}

fn default_horizon_hours() -> u32 {
    7 * 24
}

fn default_lookback_hours() -> u32 {
    24
}

fn default_max_offset_hours() -> u32 {
    48
}

fn default_interval_secs() -> u64 {
    300
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_parallelism() -> usize {
    1
}

fn default_action_timeout_secs() -> u64 {
    30
}

fn default_verify_external() -> bool {
    true
}

fn default_db_path() -> String {
    "data/calcron.db".to_string()
}

fn default_at_command() -> String {
    "at".to_string()
}

fn default_atrm_command() -> String {
    "atrm".to_string()
}

fn default_atq_command() -> String {
    "atq".to_string()
}

impl Config {
    /// Expand `${VAR_NAME}` references from the environment.
    ///
    /// Unknown variables expand to the empty string.
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();

                let mut var_name = String::new();
                while let Some(c) = chars.next() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Load configuration from a TOML file.
    ///
    /// Environment variables still take precedence over file values.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut cfg = Self::from_toml_str(&toml_content)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;

        Ok(cfg)
    }

    fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded_content = Self::expand_env_vars(content);

        let config: TomlConfig = toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;

        Ok(Self::from_toml_config(config))
    }

    /// Load configuration from an explicit path, `./calcron.toml`, or the
    /// environment, in that order.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        if let Some(path) = path {
            return Self::from_toml_file(path);
        }

        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            return Self::from_toml_file(DEFAULT_CONFIG_FILE);
        }

        Self::from_env()
    }

    fn from_toml_config(toml: TomlConfig) -> Self {
        let calendar = toml.calendar.unwrap_or_default();
        let sync = toml.sync.unwrap_or_default();
        let store = toml.store.unwrap_or_default();
        let action = toml.action.unwrap_or_default();
        let at = toml.at.unwrap_or_default();

        Config {
            calendar: CalendarConfig {
                server_url: calendar.server_url.unwrap_or_default(),
                username: calendar.username.unwrap_or_default(),
                password: calendar.password.unwrap_or_default(),
                calendar_id: calendar.calendar_id,
            },
            sync: SyncConfig {
                horizon_hours: sync.horizon_hours.unwrap_or_else(default_horizon_hours),
                lookback_hours: sync.lookback_hours.unwrap_or_else(default_lookback_hours),
                max_offset_hours: sync.max_offset_hours.unwrap_or_else(default_max_offset_hours),
                interval_secs: sync.interval_secs.unwrap_or_else(default_interval_secs),
                timezone: sync.timezone.unwrap_or_else(default_timezone),
                parallelism: sync.parallelism.unwrap_or_else(default_parallelism),
                action_timeout_secs: sync
                    .action_timeout_secs
                    .unwrap_or_else(default_action_timeout_secs),
                verify_external: sync.verify_external.unwrap_or_else(default_verify_external),
            },
            store: StoreConfig {
                db_path: store.db_path.unwrap_or_else(default_db_path),
            },
            action: ActionConfig {
                wrapper: action.wrapper.filter(|w| !w.trim().is_empty()),
            },
            at: AtConfig {
                at_command: at.at_command.unwrap_or_else(default_at_command),
                atrm_command: at.atrm_command.unwrap_or_else(default_atrm_command),
                atq_command: at.atq_command.unwrap_or_else(default_atq_command),
                queue: at.queue,
            },
        }
    }

    /// Override settings from environment variables
    fn apply_env_overrides(&mut self) -> crate::Result<()> {
        if let Ok(url) = std::env::var("CALDAV_URL") {
            if !url.is_empty() {
                self.calendar.server_url = url;
            }
        }
        if let Ok(username) = std::env::var("CALDAV_USERNAME") {
            self.calendar.username = username;
        }
        if let Ok(password) = std::env::var("CALDAV_PASSWORD") {
            self.calendar.password = password;
        }
        if let Ok(calendar) = std::env::var("CALDAV_CALENDAR") {
            if !calendar.is_empty() {
                self.calendar.calendar_id = Some(calendar);
            }
        }

        if let Ok(path) = std::env::var("CALCRON_DB_PATH") {
            self.store.db_path = path;
        }
        if let Ok(tz) = std::env::var("CALCRON_TIMEZONE") {
            if !tz.is_empty() {
                self.sync.timezone = tz;
            }
        }
        if let Some(hours) = env_number("CALCRON_HORIZON_HOURS")? {
            self.sync.horizon_hours = hours;
        }
        if let Some(secs) = env_number("CALCRON_INTERVAL_SECS")? {
            self.sync.interval_secs = secs;
        }
        if let Ok(wrapper) = std::env::var("CALCRON_WRAPPER") {
            self.action.wrapper = Some(wrapper).filter(|w| !w.trim().is_empty());
        }
        if let Ok(queue) = std::env::var("CALCRON_AT_QUEUE") {
            self.at.queue = queue.chars().next();
        }
        Ok(())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> crate::Result<Self> {
        let server_url = std::env::var("CALDAV_URL").map_err(|_| {
            Error::Config("CALDAV_URL not set and no calcron.toml found".to_string())
        })?;

        let mut cfg = Config {
            calendar: CalendarConfig::new(server_url, "", ""),
            ..Default::default()
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Reject settings the sync driver cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.calendar.server_url.trim().is_empty() {
            return Err(Error::Config("calendar.server_url is empty".to_string()));
        }
        self.sync.timezone()?;
        if self.sync.horizon_hours == 0 {
            return Err(Error::Config("sync.horizon_hours must be positive".to_string()));
        }
        if self.sync.parallelism == 0 {
            return Err(Error::Config("sync.parallelism must be at least 1".to_string()));
        }
        if self.sync.action_timeout_secs == 0 {
            return Err(Error::Config("sync.action_timeout_secs must be positive".to_string()));
        }
        if let Some(queue) = self.at.queue {
            if !queue.is_ascii_alphabetic() {
                return Err(Error::Config(format!("at.queue '{}' is not a letter", queue)));
            }
        }
        Ok(())
    }
}

/// Read a numeric environment variable; unset or empty means no override.
fn env_number<T>(name: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{} '{}': {}", name, value, e))),
        _ => Ok(None),
    }
}

// ============================================================================
// TOML file structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    calendar: Option<TomlCalendarConfig>,
    sync: Option<TomlSyncConfig>,
    store: Option<TomlStoreConfig>,
    action: Option<TomlActionConfig>,
    at: Option<TomlAtConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlCalendarConfig {
    server_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    calendar_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlSyncConfig {
    horizon_hours: Option<u32>,
    lookback_hours: Option<u32>,
    max_offset_hours: Option<u32>,
    interval_secs: Option<u64>,
    timezone: Option<String>,
    parallelism: Option<usize>,
    action_timeout_secs: Option<u64>,
    verify_external: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlStoreConfig {
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlActionConfig {
    wrapper: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlAtConfig {
    at_command: Option<String>,
    atrm_command: Option<String>,
    atq_command: Option<String>,
    queue: Option<char>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.horizon_hours, 168);
        assert_eq!(config.lookback_hours, 24);
        assert_eq!(config.parallelism, 1);
        assert!(config.verify_external);
        assert_eq!(config.timezone().unwrap(), chrono_tz::UTC);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.db_path, "data/calcron.db");
    }

    #[test]
    fn test_at_config_default() {
        let config = AtConfig::default();
        assert_eq!(config.at_command, "at");
        assert_eq!(config.atrm_command, "atrm");
        assert_eq!(config.atq_command, "atq");
        assert!(config.queue.is_none());
    }

    #[test]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("CALCRON_TEST_VAR", "test_value");
        }

        let result = Config::expand_env_vars("prefix_${CALCRON_TEST_VAR}_suffix");
        assert_eq!(result, "prefix_test_value_suffix");

        let result = Config::expand_env_vars("prefix_${CALCRON_NONEXISTENT_VAR}_suffix");
        assert_eq!(result, "prefix__suffix");

        unsafe {
            std::env::remove_var("CALCRON_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        let result = Config::expand_env_vars("no_vars_here $HOME");
        assert_eq!(result, "no_vars_here $HOME");
    }

    #[test]
    fn test_toml_config_parsing() {
        let toml_content = r#"
[calendar]
server_url = "https://dav.example.com/remote.php/dav"
username = "alice"
password = "secret"
calendar_id = "calendars/alice/jobs"

[sync]
horizon_hours = 48
timezone = "Europe/Paris"
parallelism = 4
verify_external = false

[store]
db_path = "/var/lib/calcron/records.db"

[action]
wrapper = "/usr/local/bin/calcron-run"

[at]
queue = "c"
"#;

        let config = Config::from_toml_str(toml_content).unwrap();

        assert_eq!(config.calendar.username, "alice");
        assert_eq!(config.calendar.calendar_id.as_deref(), Some("calendars/alice/jobs"));
        assert_eq!(config.sync.horizon_hours, 48);
        assert_eq!(config.sync.lookback_hours, 24);
        assert_eq!(config.sync.timezone().unwrap(), chrono_tz::Europe::Paris);
        assert_eq!(config.sync.parallelism, 4);
        assert!(!config.sync.verify_external);
        assert_eq!(config.store.db_path, "/var/lib/calcron/records.db");
        assert_eq!(config.action.wrapper.as_deref(), Some("/usr/local/bin/calcron-run"));
        assert_eq!(config.at.queue, Some('c'));
        assert_eq!(config.at.at_command, "at");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_wrapper_is_ignored() {
        let config = Config::from_toml_str("[action]\nwrapper = \"  \"\n").unwrap();
        assert!(config.action.wrapper.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config {
            calendar: CalendarConfig::new("https://dav.example.com", "u", "p"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.sync.timezone = "Mars/Olympus_Mons".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.sync.timezone = "UTC".to_string();
        config.sync.parallelism = 0;
        assert!(config.validate().is_err());

        config.sync.parallelism = 2;
        config.at.queue = Some('1');
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calcron.toml");
        std::fs::write(
            &path,
            "[calendar]\nserver_url = \"https://dav.example.com\"\n[sync]\ninterval_secs = 60\n",
        )
        .unwrap();

        let config = Config::from_toml_file(&path).unwrap();
        assert_eq!(config.sync.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_unparsable_env_number_is_config_error() {
        unsafe {
            std::env::set_var("CALCRON_TEST_HOURS", "soon");
            std::env::set_var("CALCRON_TEST_SECS", " 90 ");
        }

        let bad = env_number::<u32>("CALCRON_TEST_HOURS");
        assert!(matches!(bad, Err(Error::Config(msg)) if msg.contains("CALCRON_TEST_HOURS")));
        assert_eq!(env_number::<u64>("CALCRON_TEST_SECS").unwrap(), Some(90));
        assert_eq!(env_number::<u64>("CALCRON_TEST_UNSET").unwrap(), None);

        unsafe {
            std::env::remove_var("CALCRON_TEST_HOURS");
            std::env::remove_var("CALCRON_TEST_SECS");
        }
    }

    #[test]
    fn test_max_offset_default_and_override() {
        assert_eq!(SyncConfig::default().max_offset(), chrono::Duration::hours(48));
        let config = Config::from_toml_str("[sync]\nmax_offset_hours = 72\n").unwrap();
        assert_eq!(config.sync.max_offset_hours, 72);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = Config::from_toml_file("/nonexistent/calcron.toml");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
