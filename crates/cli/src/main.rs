// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Autossh Tray Contributors

// Autossh Tray - CLI Host
// Runs autossh profiles in the foreground and edits the stored profiles

mod display;
mod host;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::Confirm;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autossh_tray_common::{Preferences, ProfileConfig, ProfileId};

use host::RunOptions;

#[derive(Parser)]
#[command(name = "autossh-tray")]
#[command(about = "Supervise autossh SOCKS tunnels", long_about = None)]
#[command(version)]
struct Cli {
    /// Preferences file (default: <config dir>/autossh-tray/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect profiles and keep them running until interrupted
    Run {
        /// Profile to connect (repeatable)
        #[arg(short, long = "profile")]
        profiles: Vec<ProfileId>,

        /// Do not connect profiles marked as autostart
        #[arg(long)]
        no_autostart: bool,

        /// Exit once no tunnel is running anymore
        #[arg(long)]
        exit_when_idle: bool,
    },

    /// List all profiles
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,

        /// Only profiles shown in the tray menu
        #[arg(short, long)]
        menu: bool,
    },

    /// Show a profile and the command it runs
    Show {
        id: ProfileId,
    },

    /// Add a new profile, starting from the profile template
    Add {
        /// Profile name
        #[arg(short, long)]
        name: Option<String>,

        /// SSH server host
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// SSH server port
        #[arg(short = 'P', long)]
        port: Option<u16>,

        /// SSH username
        #[arg(short, long)]
        user: Option<String>,

        /// Local SOCKS port
        #[arg(short, long)]
        local_port: Option<u16>,

        /// Path to SSH private key
        #[arg(short, long)]
        key_file: Option<String>,

        /// Executable to run instead of autossh
        #[arg(short, long)]
        executable: Option<String>,

        /// Extra command line option (repeatable, replaces the template's)
        #[arg(long = "extra-option", allow_hyphen_values = true)]
        extra_options: Vec<String>,

        /// Environment override KEY=VALUE (repeatable, replaces the template's)
        #[arg(long = "env")]
        env_options: Vec<String>,

        /// Connect when `run` starts
        #[arg(long)]
        autostart: bool,

        /// Hide the profile from the tray menu
        #[arg(long)]
        hidden: bool,
    },

    /// Delete a profile
    Remove {
        id: ProfileId,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Change one field of a profile
    Set {
        id: ProfileId,
        field: String,
        /// New value; list fields take one entry per line
        #[arg(allow_hyphen_values = true)]
        value: String,
    },

    /// Application settings
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print one setting, or all of them
    Get { key: Option<String> },
    /// Change a setting
    Set { key: String, value: String },
}

/// Overrides given to `add`
struct NewProfile {
    name: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    local_port: Option<u16>,
    key_file: Option<String>,
    executable: Option<String>,
    extra_options: Vec<String>,
    env_options: Vec<String>,
    autostart: bool,
    hidden: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autossh_tray=info,autossh_tray_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut prefs = Preferences::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            profiles,
            no_autostart,
            exit_when_idle,
        } => {
            info!("Autossh Tray {} starting", env!("CARGO_PKG_VERSION"));
            let options = RunOptions {
                profiles,
                no_autostart,
                exit_when_idle,
            };
            host::run(prefs.into_shared(), options).await?;
        }
        Commands::List { json, menu } => list_profiles(&prefs, json, menu)?,
        Commands::Show { id } => display::print_profile(find_profile(&prefs, id)?),
        Commands::Add {
            name,
            host,
            port,
            user,
            local_port,
            key_file,
            executable,
            extra_options,
            env_options,
            autostart,
            hidden,
        } => {
            let request = NewProfile {
                name,
                host,
                port,
                user,
                local_port,
                key_file,
                executable,
                extra_options,
                env_options,
                autostart,
                hidden,
            };
            add_profile(&mut prefs, request)?;
        }
        Commands::Remove { id, yes } => remove_profile(&mut prefs, id, yes)?,
        Commands::Set { id, field, value } => set_profile_field(&mut prefs, id, &field, &value)?,
        Commands::Config { action } => match action {
            ConfigCommands::Get { key: None } => display::print_settings(prefs.app()),
            ConfigCommands::Get { key: Some(key) } => {
                let value = prefs
                    .app()
                    .get_field(&key)
                    .with_context(|| format!("Unknown setting '{}'", key))?;
                println!("{}", value);
            }
            ConfigCommands::Set { key, value } => {
                prefs.app_mut().set_field(&key, &value)?;
                prefs.save()?;
                println!("{}", format!("✓ {} = {}", key, value.trim()).green());
            }
        },
    }

    Ok(())
}

fn find_profile(prefs: &Preferences, id: ProfileId) -> Result<&ProfileConfig> {
    prefs
        .profile(id)
        .ok_or_else(|| autossh_tray_common::Error::ProfileNotFound(id).into())
}

fn listed_profiles(prefs: &Preferences, menu: bool) -> Vec<ProfileConfig> {
    if menu {
        prefs.menu_profiles().into_iter().cloned().collect()
    } else {
        prefs.profiles().to_vec()
    }
}

fn list_profiles(prefs: &Preferences, json: bool, menu: bool) -> Result<()> {
    let profiles = listed_profiles(prefs, menu);

    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }

    if profiles.is_empty() {
        println!("{}", "No profiles found.".yellow());
        println!("Create one with: {}", "autossh-tray add".cyan());
        return Ok(());
    }

    display::print_profiles_table(&profiles);
    Ok(())
}

fn add_profile(prefs: &mut Preferences, request: NewProfile) -> Result<()> {
    let mut profile = prefs.new_profile();

    if let Some(name) = request.name {
        profile.name = name;
    }
    if let Some(host) = request.host {
        profile.server_addr = host;
    }
    if let Some(port) = request.port {
        profile.server_port = port;
    }
    if let Some(user) = request.user {
        profile.server_user = user;
    }
    if let Some(local_port) = request.local_port {
        profile.local_port = local_port;
    }
    if let Some(key_file) = request.key_file {
        profile.key_file = key_file;
    }
    if let Some(executable) = request.executable {
        profile.executable = executable;
    }
    if !request.extra_options.is_empty() {
        profile.extra_options = request.extra_options;
    }
    if !request.env_options.is_empty() {
        profile.env_options = request.env_options;
    }
    profile.autostart = request.autostart;
    profile.show_in_menu = !request.hidden;

    profile.validate().context("Invalid profile")?;

    let id = profile.id;
    let name = profile.name.clone();
    prefs.upsert_profile(profile);
    prefs.save()?;

    println!();
    println!("{}", "✓ Profile created successfully!".green().bold());
    println!("  ID:   {}", id.to_string().cyan());
    println!("  Name: {}", name);
    println!();
    println!("Connect it with: {}", format!("autossh-tray run -p {}", id).cyan());
    Ok(())
}

fn remove_profile(prefs: &mut Preferences, id: ProfileId, yes: bool) -> Result<()> {
    let name = find_profile(prefs, id)?.name.clone();

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Are you sure you want to delete profile '{}'?",
                name.yellow()
            ))
            .default(false)
            .interact()?;

        if !confirm {
            println!("{}", "Deletion cancelled".dimmed());
            return Ok(());
        }
    }

    prefs.remove_profile(id);
    prefs.save()?;

    println!(
        "{}",
        format!("Profile '{}' deleted successfully", name).green()
    );
    Ok(())
}

fn set_profile_field(prefs: &mut Preferences, id: ProfileId, field: &str, value: &str) -> Result<()> {
    let mut profile = find_profile(prefs, id)?.clone();
    profile.set_field(field, value)?;
    profile.validate().context("Invalid profile")?;

    prefs.upsert_profile(profile);
    prefs.save()?;

    println!("{}", format!("✓ Profile {}: {} updated", id, field).green());
    Ok(())
}
