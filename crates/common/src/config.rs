// Autossh Tray - Profile Configuration
// One SSH tunnel definition, as stored in the preferences file

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ProfileId;

/// Complete autossh profile configuration
///
/// Supervisors only ever see a clone taken at connect time, so editing a
/// profile while it is connected never touches the running process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileConfig {
    /// Unique profile identifier
    pub id: ProfileId,
    /// Human-readable profile name
    #[serde(default)]
    pub name: String,
    /// Executable to run (autossh, ssh, ...)
    #[serde(default = "default_executable")]
    pub executable: String,
    /// SSH server hostname or IP
    #[serde(default)]
    pub server_addr: String,
    /// SSH server port
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// SSH username
    #[serde(default)]
    pub server_user: String,
    /// Local SOCKS port (-D)
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Path to SSH private key, `~` is expanded at connect time
    #[serde(default)]
    pub key_file: String,
    /// Extra command line options, each entry may hold several whitespace separated flags
    #[serde(default)]
    pub extra_options: Vec<String>,
    /// Environment overrides in `KEY=VALUE` form
    #[serde(default)]
    pub env_options: Vec<String>,
    /// Whether the profile is listed in the tray menu
    #[serde(default = "default_show_in_menu")]
    pub show_in_menu: bool,
    /// Connect automatically when the application starts
    #[serde(default)]
    pub autostart: bool,
}

fn default_executable() -> String {
    "autossh".to_string()
}

fn default_server_port() -> u16 {
    22
}

fn default_local_port() -> u16 {
    9999
}

fn default_show_in_menu() -> bool {
    true
}

/// Names accepted by [`ProfileConfig::set_field`]
pub const PROFILE_FIELDS: &[&str] = &[
    "name",
    "executable",
    "server_addr",
    "server_port",
    "server_user",
    "local_port",
    "key_file",
    "extra_options",
    "env_options",
    "show_in_menu",
    "autostart",
];

impl ProfileConfig {
    /// Create a profile with default values for everything but the id and name
    pub fn new(id: ProfileId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            executable: default_executable(),
            server_addr: String::new(),
            server_port: default_server_port(),
            server_user: String::new(),
            local_port: default_local_port(),
            key_file: String::new(),
            extra_options: Vec::new(),
            env_options: Vec::new(),
            show_in_menu: default_show_in_menu(),
            autostart: false,
        }
    }

    /// Validate the profile the way the editor does before saving
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("Name cannot be empty".to_string()));
        }
        if self.executable.trim().is_empty() {
            return Err(Error::Config("Executable cannot be empty".to_string()));
        }
        if self.server_addr.trim().is_empty() {
            return Err(Error::Config("Server address cannot be empty".to_string()));
        }
        if self.server_user.trim().is_empty() {
            return Err(Error::Config("User cannot be empty".to_string()));
        }
        if self.server_port == 0 {
            return Err(Error::Config("Server port must be greater than 0".to_string()));
        }
        if self.local_port == 0 {
            return Err(Error::Config("Local port must be greater than 0".to_string()));
        }
        if self.key_file.trim().is_empty() {
            return Err(Error::Config("Key file cannot be empty".to_string()));
        }

        for option in &self.env_options {
            if split_env_option(option).is_none() {
                return Err(Error::Config(format!(
                    "Environment option '{}' must have the form KEY=VALUE",
                    option
                )));
            }
        }

        Ok(())
    }

    /// Set a field from its textual representation
    ///
    /// List fields take one entry per line; blank lines are dropped.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<()> {
        match field {
            "name" => self.name = value.trim().to_string(),
            "executable" => self.executable = value.trim().to_string(),
            "server_addr" => self.server_addr = value.trim().to_string(),
            "server_port" => self.server_port = parse_port(field, value)?,
            "server_user" => self.server_user = value.trim().to_string(),
            "local_port" => self.local_port = parse_port(field, value)?,
            "key_file" => self.key_file = value.trim().to_string(),
            "extra_options" => self.extra_options = parse_lines(value),
            "env_options" => self.env_options = parse_lines(value),
            "show_in_menu" => self.show_in_menu = parse_bool(field, value)?,
            "autostart" => self.autostart = parse_bool(field, value)?,
            other => {
                return Err(Error::Config(format!(
                    "Unknown profile field '{}' (expected one of: {})",
                    other,
                    PROFILE_FIELDS.join(", ")
                )))
            }
        }
        Ok(())
    }
}

/// Split a `KEY=VALUE` override at the first `=`
///
/// Returns `None` when there is no `=` or the key would be empty.
pub fn split_env_option(option: &str) -> Option<(&str, &str)> {
    match option.find('=') {
        Some(pos) if pos > 0 => Some((&option[..pos], &option[pos + 1..])),
        _ => None,
    }
}

pub(crate) fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(Error::Config(format!(
            "Invalid boolean '{}' for {}",
            other, field
        ))),
    }
}

pub(crate) fn parse_lines(value: &str) -> Vec<String> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_port(field: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| Error::Config(format!("Invalid port '{}' for {}: {}", value.trim(), field, e)))
}
