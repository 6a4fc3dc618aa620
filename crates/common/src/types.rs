// Common types for Autossh Tray

use serde::{Deserialize, Serialize};

/// Profile identifier, allocated monotonically by the preferences store
pub type ProfileId = u32;

/// Exit code reported when the external process could not be spawned
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;

/// Lifecycle of a single supervised process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,        // constructed, start() not called yet
    Starting,    // spawn scheduled on the background task
    Running,     // process alive, pump loop forwarding output
    Stopping,    // terminate signal sent, waiting for confirmed exit
    Terminated,  // exit confirmed, stop callback fired
}

impl SupervisorState {
    /// Whether the supervisor counts as active (connected or connecting)
    pub fn is_active(&self) -> bool {
        matches!(self, SupervisorState::Starting | SupervisorState::Running)
    }

    /// Whether the process lifecycle is over
    pub fn is_terminated(&self) -> bool {
        matches!(self, SupervisorState::Terminated)
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Events emitted by the profile registry
///
/// UI collaborators treat these as "redraw when convenient".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A supervisor was created and started for the profile
    Connecting { id: ProfileId },

    /// Termination was requested for the profile's process
    StopRequested { id: ProfileId },

    /// The profile's process exited and the profile was removed from the registry
    Stopped {
        id: ProfileId,
        exit_code: Option<i32>,
    },
}

impl RegistryEvent {
    pub fn profile_id(&self) -> ProfileId {
        match self {
            RegistryEvent::Connecting { id }
            | RegistryEvent::StopRequested { id }
            | RegistryEvent::Stopped { id, .. } => *id,
        }
    }
}
