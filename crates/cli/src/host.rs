// Autossh Tray - Host Loop
// Owns the registry for the lifetime of the process and mirrors the log to the console

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use autossh_tray_common::{
    LogSink, ProfileId, ProfileRegistry, ProfileSource, RegistryEvent, SharedPreferences,
};

/// Options of the `run` subcommand
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Profiles to connect in addition to (or instead of) the autostart set
    pub profiles: Vec<ProfileId>,
    pub no_autostart: bool,
    pub exit_when_idle: bool,
}

pub async fn run(prefs: SharedPreferences, options: RunOptions) -> Result<()> {
    let (app, autostart) = {
        let prefs = prefs
            .read()
            .map_err(|_| anyhow::anyhow!("Preferences lock poisoned"))?;
        (prefs.app().clone(), prefs.autostart_profiles())
    };

    let sink = LogSink::new(app.log_keep_entries);
    sink.add_observer("console", |line| {
        let stamp = chrono::Local::now().format("%H:%M:%S").to_string();
        println!("{} {}", stamp.dimmed(), line);
    });

    let store: Arc<dyn ProfileSource> = prefs.clone();
    let registry = ProfileRegistry::new(store, sink, Handle::current(), app.poll_interval());

    // Trace registry events
    let mut event_rx = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(RegistryEvent::Stopped { id, exit_code }) => {
                    info!("Profile {} stopped (exit code {:?})", id, exit_code)
                }
                Ok(event) => debug!("Registry event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} registry events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut to_connect = Vec::new();
    if !options.no_autostart {
        to_connect.extend(autostart);
    }
    for id in options.profiles {
        if !to_connect.contains(&id) {
            to_connect.push(id);
        }
    }

    if to_connect.is_empty() {
        println!(
            "{}",
            "No profiles to connect (use --profile <ID> or mark profiles as autostart)".yellow()
        );
        if options.exit_when_idle {
            return Ok(());
        }
    }

    registry.connect_autostart(to_connect);

    let idle = wait_until_idle(&registry, app.poll_interval(), options.exit_when_idle);
    tokio::select! {
        result = shutdown_signal() => result?,
        _ = idle => info!("No tunnels left running"),
    }

    info!("Stopping {} tunnel(s)", registry.active_count());
    if registry.shutdown(app.stop_timeout()).await {
        info!("All tunnels stopped");
    } else {
        warn!("Some tunnels did not exit: {:?}", registry.active_ids());
    }

    Ok(())
}

async fn wait_until_idle(
    registry: &ProfileRegistry,
    poll_interval: std::time::Duration,
    enabled: bool,
) {
    if !enabled {
        return std::future::pending().await;
    }
    while registry.active_count() > 0 {
        tokio::time::sleep(poll_interval).await;
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}
