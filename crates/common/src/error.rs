// Error types for Autossh Tray

use thiserror::Error;

use crate::types::ProfileId;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing profile / settings fields. Raised before any spawn.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No SSH profile with id {0}")]
    ProfileNotFound(ProfileId),

    /// The external executable could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected failure inside a supervisor's monitoring loop.
    #[error("Supervisor error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
