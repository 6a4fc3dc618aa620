// Autossh Tray - Console Output
// Tables and detail views for profiles and settings

use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};

use autossh_tray_common::config::split_env_option;
use autossh_tray_common::{build_command, AppSettings, ProfileConfig, APP_FIELDS};

pub fn print_profiles_table(profiles: &[ProfileConfig]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(
        ["ID", "Name", "Server", "SOCKS Port", "Menu", "Autostart"]
            .into_iter()
            .map(|title| Cell::new(title).add_attribute(Attribute::Bold).fg(Color::Cyan)),
    );

    for profile in profiles {
        let server = format!(
            "{}@{}:{}",
            profile.server_user, profile.server_addr, profile.server_port
        );

        table.add_row(vec![
            Cell::new(profile.id),
            Cell::new(&profile.name).fg(Color::Green),
            Cell::new(server),
            Cell::new(profile.local_port),
            flag_cell(profile.show_in_menu),
            flag_cell(profile.autostart),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} profile(s) found", profiles.len().to_string().cyan());
    println!();
}

fn flag_cell(value: bool) -> Cell {
    if value {
        Cell::new("yes").fg(Color::Green)
    } else {
        Cell::new("no").fg(Color::DarkGrey)
    }
}

/// Profile details plus the exact command it would run
pub fn print_profile(profile: &ProfileConfig) {
    println!();
    println!("{}", format!("Profile: {}", profile.name).bold().green());
    println!("  ID: {}", profile.id.to_string().dimmed());

    println!();
    println!("{}", "  Connection:".bold());
    println!("    Executable: {}", profile.executable);
    println!("    Server:     {}:{}", profile.server_addr, profile.server_port);
    println!("    User:       {}", profile.server_user);
    println!("    SOCKS port: {}", profile.local_port);
    println!("    Key:        {}", profile.key_file);

    println!();
    println!("{}", "  Options:".bold());
    println!("    Show in menu: {}", profile.show_in_menu);
    println!("    Autostart:    {}", profile.autostart);

    println!();
    println!("{}", "  Command:".bold());
    match build_command(profile) {
        Ok(command) => println!("    {}", command.display()),
        Err(e) => println!("    {}", e.to_string().red()),
    }

    println!();
    println!("{}", "  Environment overrides:".bold());
    if profile.env_options.is_empty() {
        println!("    {}", "none".dimmed());
    }
    for option in &profile.env_options {
        match split_env_option(option) {
            Some((key, value)) => println!("    {}={}", key.cyan(), value),
            None => println!("    {} {}", option, "(ignored, not KEY=VALUE)".yellow()),
        }
    }

    println!();
}

pub fn print_settings(app: &AppSettings) {
    for key in APP_FIELDS {
        if let Some(value) = app.get_field(key) {
            println!("{} = {}", key.cyan(), value);
        }
    }
}
