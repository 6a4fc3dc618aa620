// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Autossh Tray Contributors

// Autossh Tray - Common Library
// Profiles, preferences, the log sink and the tunnel process supervisor

pub mod command;
pub mod config;
pub mod error;
pub mod log_sink;
pub mod preferences;
pub mod registry;
pub mod supervisor;
pub mod types;

pub use command::{build_command, build_command_with, TunnelCommand};
pub use config::{ProfileConfig, PROFILE_FIELDS};
pub use error::{Error, Result};
pub use log_sink::{LogPayload, LogSink, ObserverToken, DEFAULT_CAPACITY};
pub use preferences::{
    AppSettings, IconTheme, Preferences, ProfileTemplate, Settings, SharedPreferences, APP_FIELDS,
};
pub use registry::{ProfileRegistry, ProfileSource};
pub use supervisor::{signal_group, GroupSignal, ProcessSupervisor};
pub use types::{ProfileId, RegistryEvent, SupervisorState, SPAWN_FAILED_EXIT_CODE};
