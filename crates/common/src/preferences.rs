// Autossh Tray - Preferences
// Application settings and the profile store, persisted as TOML.
// Every field has a declared type and default; nothing is inferred from stored values.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{parse_bool, parse_lines, ProfileConfig};
use crate::error::Error;
use crate::log_sink::DEFAULT_CAPACITY;
use crate::registry::ProfileSource;
use crate::types::ProfileId;

/// Preferences shared between the UI thread and the registry
pub type SharedPreferences = Arc<RwLock<Preferences>>;

/// Tray icon theme
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IconTheme {
    #[default]
    Light,
    Dark,
}

impl std::str::FromStr for IconTheme {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(IconTheme::Light),
            "dark" => Ok(IconTheme::Dark),
            other => Err(Error::Config(format!(
                "Unknown icon theme '{}' (expected light or dark)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for IconTheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IconTheme::Light => f.write_str("light"),
            IconTheme::Dark => f.write_str("dark"),
        }
    }
}

/// Application-wide settings (`[app]` table)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSettings {
    /// Supervisor liveness poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Number of log lines kept in history
    #[serde(default = "default_log_keep_entries")]
    pub log_keep_entries: usize,
    /// Scroll the log view to the newest line
    #[serde(default)]
    pub log_autoscroll: bool,
    #[serde(default)]
    pub icon_theme: IconTheme,
    /// Start the application with the desktop session
    #[serde(default)]
    pub autostart: bool,
    /// Seconds to wait for tunnels on shutdown before killing them (0 = wait forever)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: f64,
}

fn default_poll_interval() -> f64 {
    0.1
}

fn default_log_keep_entries() -> usize {
    DEFAULT_CAPACITY
}

fn default_stop_timeout() -> f64 {
    5.0
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            log_keep_entries: default_log_keep_entries(),
            log_autoscroll: false,
            icon_theme: IconTheme::default(),
            autostart: false,
            stop_timeout: default_stop_timeout(),
        }
    }
}

/// Names accepted by [`AppSettings::set_field`] and [`AppSettings::get_field`]
pub const APP_FIELDS: &[&str] = &[
    "poll_interval",
    "log_keep_entries",
    "log_autoscroll",
    "icon_theme",
    "autostart",
    "stop_timeout",
];

impl AppSettings {
    pub fn validate(&self) -> crate::Result<()> {
        if !self.poll_interval.is_finite() || self.poll_interval <= 0.0 {
            return Err(Error::Config(format!(
                "poll_interval must be a positive number of seconds, got {}",
                self.poll_interval
            )));
        }
        if !self.stop_timeout.is_finite() || self.stop_timeout < 0.0 {
            return Err(Error::Config(format!(
                "stop_timeout must be zero or a positive number of seconds, got {}",
                self.stop_timeout
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    /// Shutdown escalation timeout, `None` when disabled
    pub fn stop_timeout(&self) -> Option<Duration> {
        if self.stop_timeout > 0.0 {
            Some(Duration::from_secs_f64(self.stop_timeout))
        } else {
            None
        }
    }

    /// Set a field from text according to its declared type
    ///
    /// The settings are left untouched when the value does not parse or fails validation.
    pub fn set_field(&mut self, field: &str, value: &str) -> crate::Result<()> {
        let mut updated = self.clone();
        match field {
            "poll_interval" => updated.poll_interval = parse_f64(field, value)?,
            "log_keep_entries" => {
                updated.log_keep_entries = value.trim().parse().map_err(|e| {
                    Error::Config(format!("Invalid count '{}' for {}: {}", value.trim(), field, e))
                })?
            }
            "log_autoscroll" => updated.log_autoscroll = parse_bool(field, value)?,
            "icon_theme" => updated.icon_theme = value.parse()?,
            "autostart" => updated.autostart = parse_bool(field, value)?,
            "stop_timeout" => updated.stop_timeout = parse_f64(field, value)?,
            other => {
                return Err(Error::Config(format!(
                    "Unknown setting '{}' (expected one of: {})",
                    other,
                    APP_FIELDS.join(", ")
                )))
            }
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Textual value of a field
    pub fn get_field(&self, field: &str) -> Option<String> {
        let value = match field {
            "poll_interval" => self.poll_interval.to_string(),
            "log_keep_entries" => self.log_keep_entries.to_string(),
            "log_autoscroll" => self.log_autoscroll.to_string(),
            "icon_theme" => self.icon_theme.to_string(),
            "autostart" => self.autostart.to_string(),
            "stop_timeout" => self.stop_timeout.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

fn parse_f64(field: &str, value: &str) -> crate::Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|e| Error::Config(format!("Invalid number '{}' for {}: {}", value.trim(), field, e)))
}

/// Defaults for newly created profiles (`[profile_template]` table)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileTemplate {
    /// Name pattern, `{id}` is replaced with the new profile id
    #[serde(default = "default_template_name")]
    pub name: String,
    #[serde(default = "default_template_executable")]
    pub executable: String,
    #[serde(default = "default_template_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_template_server_port")]
    pub server_port: u16,
    #[serde(default = "default_template_server_user")]
    pub server_user: String,
    #[serde(default = "default_template_local_port")]
    pub local_port: u16,
    #[serde(default = "default_template_key_file")]
    pub key_file: String,
    #[serde(default = "default_template_extra_options")]
    pub extra_options: Vec<String>,
    #[serde(default = "default_template_env_options")]
    pub env_options: Vec<String>,
    #[serde(default = "default_template_show_in_menu")]
    pub show_in_menu: bool,
    #[serde(default)]
    pub autostart: bool,
}

fn default_template_name() -> String {
    "SSH Profile {id}".to_string()
}

fn default_template_executable() -> String {
    "autossh".to_string()
}

fn default_template_server_addr() -> String {
    "1.2.3.4".to_string()
}

fn default_template_server_port() -> u16 {
    22
}

fn default_template_server_user() -> String {
    "user".to_string()
}

fn default_template_local_port() -> u16 {
    9999
}

fn default_template_key_file() -> String {
    "~/.ssh/id_pub".to_string()
}

fn default_template_extra_options() -> Vec<String> {
    vec![
        "-v -C -N -T".to_string(),
        "-o TCPKeepAlive=yes".to_string(),
        "-o ServerAliveInterval=300".to_string(),
    ]
}

fn default_template_env_options() -> Vec<String> {
    vec![
        "AUTOSSH_POLL=30".to_string(),
        "AUTOSSH_GATETIME=0".to_string(),
        "AUTOSSH_DEBUG=1".to_string(),
        "AUTOSSH_PORT=0".to_string(),
    ]
}

fn default_template_show_in_menu() -> bool {
    true
}

impl Default for ProfileTemplate {
    fn default() -> Self {
        Self {
            name: default_template_name(),
            executable: default_template_executable(),
            server_addr: default_template_server_addr(),
            server_port: default_template_server_port(),
            server_user: default_template_server_user(),
            local_port: default_template_local_port(),
            key_file: default_template_key_file(),
            extra_options: default_template_extra_options(),
            env_options: default_template_env_options(),
            show_in_menu: default_template_show_in_menu(),
            autostart: false,
        }
    }
}

impl ProfileTemplate {
    /// Instantiate the template for the given id
    pub fn instantiate(&self, id: ProfileId) -> ProfileConfig {
        let name = self
            .name
            .replace("{id}", &id.to_string())
            .replace("{0}", &id.to_string());

        ProfileConfig {
            id,
            name,
            executable: self.executable.clone(),
            server_addr: self.server_addr.clone(),
            server_port: self.server_port,
            server_user: self.server_user.clone(),
            local_port: self.local_port,
            key_file: self.key_file.clone(),
            extra_options: self.extra_options.clone(),
            env_options: self.env_options.clone(),
            show_in_menu: self.show_in_menu,
            autostart: self.autostart,
        }
    }
}

/// Everything stored in the preferences file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Highest profile id ever handed out
    #[serde(default)]
    pub last_profile_id: ProfileId,
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub profile_template: ProfileTemplate,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

impl Settings {
    /// Sort profiles by id, drop duplicate ids and repair the id counter
    fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.profiles.retain(|p| {
            if seen.insert(p.id) {
                true
            } else {
                warn!("Dropping duplicate profile id {} ({})", p.id, p.name);
                false
            }
        });
        self.profiles.sort_by_key(|p| p.id);

        let max_id = self.profiles.iter().map(|p| p.id).max().unwrap_or(0);
        self.last_profile_id = self.last_profile_id.max(max_id);
    }
}

/// Preferences file plus its in-memory state
#[derive(Debug, Clone)]
pub struct Preferences {
    path: PathBuf,
    settings: Settings,
}

impl Preferences {
    /// Default location: `<config dir>/autossh-tray/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("autossh-tray").join("config.toml"))
    }

    /// Load from the given path, or the default location
    ///
    /// A missing file yields the defaults, which are written out immediately.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            info!("No preferences found, using defaults");
            info!("Preferences will be saved to: {}", path.display());
            let prefs = Self::with_settings(path, Settings::default());
            prefs.save()?;
            return Ok(prefs);
        }

        let contents = fs::read_to_string(&path)
            .context(format!("Failed to read {}", path.display()))?;

        let settings: Settings =
            toml::from_str(&contents).context(format!("Failed to parse {}", path.display()))?;

        settings
            .app
            .validate()
            .context("Preferences validation failed")?;

        debug!("Loaded preferences from {}", path.display());
        Ok(Self::with_settings(path, settings))
    }

    /// Wrap settings without touching the disk
    pub fn with_settings(path: impl Into<PathBuf>, mut settings: Settings) -> Self {
        settings.normalize();
        Self {
            path: path.into(),
            settings,
        }
    }

    /// Write the preferences file, creating its directory
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create preferences directory")?;
        }

        let contents =
            toml::to_string_pretty(&self.settings).context("Failed to serialize preferences")?;

        fs::write(&self.path, contents)
            .context(format!("Failed to write preferences to {}", self.path.display()))?;

        info!("Configuration saved as {}", self.path.display());
        Ok(())
    }

    pub fn into_shared(self) -> SharedPreferences {
        Arc::new(RwLock::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn app(&self) -> &AppSettings {
        &self.settings.app
    }

    pub fn app_mut(&mut self) -> &mut AppSettings {
        &mut self.settings.app
    }

    pub fn template(&self) -> &ProfileTemplate {
        &self.settings.profile_template
    }

    /// All profiles, ordered by id
    pub fn profiles(&self) -> &[ProfileConfig] {
        &self.settings.profiles
    }

    pub fn profile(&self, id: ProfileId) -> Option<&ProfileConfig> {
        self.settings.profiles.iter().find(|p| p.id == id)
    }

    /// Allocate a fresh id and build a profile from the template
    ///
    /// The profile is not stored until passed to [`Preferences::upsert_profile`].
    pub fn new_profile(&mut self) -> ProfileConfig {
        self.settings.last_profile_id += 1;
        self.settings
            .profile_template
            .instantiate(self.settings.last_profile_id)
    }

    /// Insert or replace a profile; returns true when an existing profile was replaced
    pub fn upsert_profile(&mut self, profile: ProfileConfig) -> bool {
        self.settings.last_profile_id = self.settings.last_profile_id.max(profile.id);

        if let Some(existing) = self
            .settings
            .profiles
            .iter_mut()
            .find(|p| p.id == profile.id)
        {
            *existing = profile;
            return true;
        }

        self.settings.profiles.push(profile);
        self.settings.profiles.sort_by_key(|p| p.id);
        false
    }

    pub fn remove_profile(&mut self, id: ProfileId) -> Option<ProfileConfig> {
        let index = self.settings.profiles.iter().position(|p| p.id == id)?;
        debug!("Removing profile {}", id);
        Some(self.settings.profiles.remove(index))
    }

    /// Ids of profiles that connect when the application starts
    pub fn autostart_profiles(&self) -> Vec<ProfileId> {
        self.settings
            .profiles
            .iter()
            .filter(|p| p.autostart)
            .map(|p| p.id)
            .collect()
    }

    /// Profiles shown in the tray menu
    pub fn menu_profiles(&self) -> Vec<&ProfileConfig> {
        self.settings
            .profiles
            .iter()
            .filter(|p| p.show_in_menu)
            .collect()
    }
}

impl ProfileSource for Preferences {
    fn get(&self, id: ProfileId) -> Option<ProfileConfig> {
        self.profile(id).cloned()
    }
}

impl ProfileSource for RwLock<Preferences> {
    fn get(&self, id: ProfileId) -> Option<ProfileConfig> {
        let prefs = self.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        prefs.profile(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_prefs() -> (tempfile::TempDir, Preferences) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("autossh-tray").join("config.toml");
        let prefs = Preferences::load(Some(&path)).expect("load defaults");
        (dir, prefs)
    }

    #[test]
    fn test_default_path() {
        let path = Preferences::default_path().expect("Should get preferences path");
        assert!(path.to_string_lossy().contains("autossh-tray"));
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_missing_file_writes_defaults() {
        let (_dir, prefs) = temp_prefs();
        assert!(prefs.path().exists());
        assert_eq!(prefs.app(), &AppSettings::default());
        assert!(prefs.profiles().is_empty());
        assert_eq!(prefs.app().poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let (_dir, mut prefs) = temp_prefs();
        let mut profile = prefs.new_profile();
        profile.server_addr = "10.0.0.5".to_string();
        profile.autostart = true;
        prefs.upsert_profile(profile.clone());
        prefs.app_mut().log_keep_entries = 42;
        prefs.save().unwrap();

        let reloaded = Preferences::load(Some(prefs.path())).unwrap();
        assert_eq!(reloaded.profile(profile.id), Some(&profile));
        assert_eq!(reloaded.app().log_keep_entries, 42);
        assert_eq!(reloaded.autostart_profiles(), vec![profile.id]);
    }

    #[test]
    fn test_new_profile_ids_are_monotonic() {
        let (_dir, mut prefs) = temp_prefs();
        let first = prefs.new_profile();
        prefs.upsert_profile(first.clone());
        let second = prefs.new_profile();
        prefs.upsert_profile(second.clone());

        assert_eq!(first.id, 1);
        assert_eq!(first.name, "SSH Profile 1");
        assert_eq!(second.id, 2);

        // Deleting the newest profile never lets its id be reused
        prefs.remove_profile(second.id);
        assert_eq!(prefs.new_profile().id, 3);
    }

    #[test]
    fn test_template_fills_new_profile() {
        let (_dir, mut prefs) = temp_prefs();
        let profile = prefs.new_profile();
        assert_eq!(profile.executable, "autossh");
        assert_eq!(profile.key_file, "~/.ssh/id_pub");
        assert_eq!(profile.env_options.len(), 4);
        assert!(profile.show_in_menu);
    }

    #[test]
    fn test_load_normalizes_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[app]
poll_interval = 0.5

[[profiles]]
id = 7
name = "second"

[[profiles]]
id = 3
name = "first"

[[profiles]]
id = 7
name = "duplicate"
"#,
        )
        .unwrap();

        let mut prefs = Preferences::load(Some(&path)).unwrap();
        let names: Vec<_> = prefs.profiles().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(prefs.app().poll_interval, 0.5);
        assert_eq!(prefs.app().log_keep_entries, DEFAULT_CAPACITY);
        assert_eq!(prefs.new_profile().id, 8);
    }

    #[test]
    fn test_load_rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[app]\npoll_interval = 0.0\n").unwrap();
        assert!(Preferences::load(Some(&path)).is_err());

        fs::write(&path, "this is not toml = = =").unwrap();
        assert!(Preferences::load(Some(&path)).is_err());
    }

    #[test]
    fn test_app_set_field_is_schema_driven() {
        let mut app = AppSettings::default();
        app.set_field("poll_interval", "0.25").unwrap();
        app.set_field("log_autoscroll", "on").unwrap();
        app.set_field("icon_theme", "Dark").unwrap();
        app.set_field("log_keep_entries", "500").unwrap();

        assert_eq!(app.poll_interval, 0.25);
        assert!(app.log_autoscroll);
        assert_eq!(app.icon_theme, IconTheme::Dark);
        assert_eq!(app.get_field("log_keep_entries").as_deref(), Some("500"));

        assert!(app.set_field("poll_interval", "-1").is_err());
        assert!(app.set_field("log_keep_entries", "lots").is_err());
        assert!(app.set_field("unknown", "1").is_err());
        assert_eq!(app.poll_interval, 0.25);
        assert_eq!(app.get_field("unknown"), None);
    }

    #[test]
    fn test_stop_timeout_zero_disables_escalation() {
        let mut app = AppSettings::default();
        assert_eq!(app.stop_timeout(), Some(Duration::from_secs(5)));
        app.set_field("stop_timeout", "0").unwrap();
        assert_eq!(app.stop_timeout(), None);
    }

    #[test]
    fn test_upsert_replaces_and_menu_filter() {
        let (_dir, mut prefs) = temp_prefs();
        let mut profile = prefs.new_profile();
        assert!(!prefs.upsert_profile(profile.clone()));

        profile.show_in_menu = false;
        profile.name = "renamed".to_string();
        assert!(prefs.upsert_profile(profile.clone()));

        assert_eq!(prefs.profiles().len(), 1);
        assert_eq!(prefs.profile(profile.id).unwrap().name, "renamed");
        assert!(prefs.menu_profiles().is_empty());
    }

    #[test]
    fn test_profile_source_returns_snapshot() {
        let (_dir, mut prefs) = temp_prefs();
        let profile = prefs.new_profile();
        prefs.upsert_profile(profile.clone());
        let shared = prefs.into_shared();

        let snapshot = shared.get(profile.id).unwrap();
        shared.write().unwrap().remove_profile(profile.id);

        assert_eq!(snapshot, profile);
        assert!(shared.get(profile.id).is_none());
    }
}
