// Autossh Tray - Command Builder
// Turns a profile into the argument vector and environment of the tunnel process

use std::collections::BTreeMap;

use crate::config::{split_env_option, ProfileConfig};
use crate::error::{Error, Result};

/// Everything needed to spawn one tunnel process
///
/// The argument vector goes straight to process creation, never through a
/// shell, so values are only trimmed, not quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    /// Executable followed by its arguments, never empty
    argv: Vec<String>,
    /// Full environment for the child (ambient environment plus overrides)
    env: BTreeMap<String, String>,
}

impl TunnelCommand {
    /// Wrap an argument vector and environment; the executable must be present
    pub fn new(argv: Vec<String>, env: BTreeMap<String, String>) -> Result<Self> {
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Ok(Self { argv, env }),
            _ => Err(Error::Config("Command has no executable".to_string())),
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Space-joined argument vector, for logs only
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Build the command for a profile using the current process environment and home directory
pub fn build_command(profile: &ProfileConfig) -> Result<TunnelCommand> {
    let home = dirs::home_dir().and_then(|p| p.to_str().map(str::to_string));
    build_command_with(profile, ambient_env(), home.as_deref())
}

/// Build the command for a profile against an explicit environment and home directory
pub fn build_command_with<I>(
    profile: &ProfileConfig,
    ambient: I,
    home: Option<&str>,
) -> Result<TunnelCommand>
where
    I: IntoIterator<Item = (String, String)>,
{
    let executable = clean(&profile.executable);
    if executable.is_empty() {
        return Err(Error::Config(format!(
            "Profile {} has no executable",
            profile.id
        )));
    }

    let key_file = clean(&profile.key_file);
    if key_file.is_empty() {
        return Err(Error::Config(format!(
            "Profile {} has no key file",
            profile.id
        )));
    }
    let key_file = clean(expand_user(&key_file, home));

    let mut argv = vec![executable];
    argv.extend(["-D".to_string(), clean(profile.local_port)]);
    argv.push(clean(&profile.server_addr));
    argv.extend(["-p".to_string(), clean(profile.server_port)]);
    argv.extend(["-l".to_string(), clean(&profile.server_user)]);
    argv.extend(["-i".to_string(), key_file]);

    for option in &profile.extra_options {
        argv.extend(option.split_whitespace().map(clean));
    }

    TunnelCommand::new(argv, overlay_env(ambient, &profile.env_options))
}

/// Ambient environment overlaid with `KEY=VALUE` overrides; malformed entries are skipped
pub fn overlay_env<I>(ambient: I, overrides: &[String]) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = ambient.into_iter().collect();

    for option in overrides {
        if let Some((key, value)) = split_env_option(option) {
            env.insert(key.to_string(), value.to_string());
        }
    }

    env
}

/// Expand a leading `~` to the given home directory
pub fn expand_user(path: &str, home: Option<&str>) -> String {
    shellexpand::tilde_with_context(path, || home).into_owned()
}

fn clean(value: impl ToString) -> String {
    value.to_string().trim().to_string()
}

// Entries that are not valid unicode cannot be represented in the map; they are skipped.
fn ambient_env() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob_profile() -> ProfileConfig {
        let mut profile = ProfileConfig::new(1, "office");
        profile.executable = "autossh".to_string();
        profile.server_addr = "10.0.0.5".to_string();
        profile.server_port = 22;
        profile.server_user = "bob".to_string();
        profile.local_port = 1080;
        profile.key_file = "~/.ssh/id_rsa".to_string();
        profile.extra_options = vec!["-v -C".to_string()];
        profile.env_options = vec!["AUTOSSH_POLL=30".to_string()];
        profile
    }

    #[test]
    fn test_build_documented_argv() {
        let command = build_command_with(&bob_profile(), Vec::new(), Some("/home/bob")).unwrap();

        assert_eq!(
            command.argv(),
            vec![
                "autossh",
                "-D",
                "1080",
                "10.0.0.5",
                "-p",
                "22",
                "-l",
                "bob",
                "-i",
                "/home/bob/.ssh/id_rsa",
                "-v",
                "-C"
            ]
        );
        assert_eq!(command.env().get("AUTOSSH_POLL").map(String::as_str), Some("30"));
        assert_eq!(command.program(), "autossh");
        assert_eq!(command.args().len(), 11);
    }

    #[test]
    fn test_build_is_deterministic() {
        let ambient = vec![("PATH".to_string(), "/usr/bin".to_string())];
        let first = build_command_with(&bob_profile(), ambient.clone(), Some("/home/bob")).unwrap();
        let second = build_command_with(&bob_profile(), ambient, Some("/home/bob")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_scalar_values_are_trimmed() {
        let mut profile = bob_profile();
        profile.executable = "  /usr/bin/autossh \t".to_string();
        profile.server_addr = " host.example ".to_string();
        profile.server_user = "bob\n".to_string();
        profile.key_file = " /keys/id ".to_string();

        let command = build_command_with(&profile, Vec::new(), None).unwrap();
        assert_eq!(command.argv()[0], "/usr/bin/autossh");
        assert_eq!(command.argv()[3], "host.example");
        assert_eq!(command.argv()[7], "bob");
        assert_eq!(command.argv()[9], "/keys/id");
    }

    #[test]
    fn test_extra_options_are_flattened_in_order() {
        let mut profile = bob_profile();
        profile.extra_options = vec![
            "-v -C -N -T".to_string(),
            "  -o   TCPKeepAlive=yes ".to_string(),
            String::new(),
        ];

        let command = build_command_with(&profile, Vec::new(), Some("/home/bob")).unwrap();
        assert_eq!(
            &command.argv()[10..],
            &["-v", "-C", "-N", "-T", "-o", "TCPKeepAlive=yes"]
        );
    }

    #[test]
    fn test_env_overlay_skips_malformed_entries() {
        let ambient = vec![
            ("HOME".to_string(), "/home/bob".to_string()),
            ("AUTOSSH_POLL".to_string(), "600".to_string()),
        ];
        let overrides = vec![
            "AUTOSSH_POLL=30".to_string(),
            "NO_EQUALS".to_string(),
            "=leading".to_string(),
            "AUTOSSH_PATH=/usr/bin/ssh=x".to_string(),
        ];

        let env = overlay_env(ambient, &overrides);
        assert_eq!(env.len(), 3);
        assert_eq!(env["HOME"], "/home/bob");
        assert_eq!(env["AUTOSSH_POLL"], "30");
        assert_eq!(env["AUTOSSH_PATH"], "/usr/bin/ssh=x");
        assert!(!env.contains_key(""));
        assert!(!env.contains_key("NO_EQUALS"));
    }

    #[test]
    fn test_missing_executable_is_config_error() {
        let mut profile = bob_profile();
        profile.executable = "   ".to_string();
        let err = build_command_with(&profile, Vec::new(), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_key_file_is_config_error() {
        let mut profile = bob_profile();
        profile.key_file = String::new();
        let err = build_command_with(&profile, Vec::new(), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_command_requires_executable() {
        assert!(TunnelCommand::new(Vec::new(), BTreeMap::new()).is_err());
        assert!(TunnelCommand::new(vec![" ".to_string()], BTreeMap::new()).is_err());

        let command = TunnelCommand::new(vec!["autossh".to_string()], BTreeMap::new()).unwrap();
        assert_eq!(command.program(), "autossh");
        assert!(command.args().is_empty());
    }

    #[test]
    fn test_expand_user_without_home_keeps_tilde() {
        assert_eq!(expand_user("~/.ssh/id", None), "~/.ssh/id");
        assert_eq!(expand_user("/abs/id", Some("/home/bob")), "/abs/id");
    }
}
