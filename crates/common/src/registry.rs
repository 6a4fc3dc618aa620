// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Autossh Tray Contributors

// Autossh Tray - Profile Registry
// Tracks which profiles currently have a live supervisor

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ProfileConfig;
use crate::error::Error;
use crate::log_sink::LogSink;
use crate::supervisor::ProcessSupervisor;
use crate::types::{ProfileId, RegistryEvent};

/// How long killed processes get to be reaped during shutdown
const KILL_GRACE: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 100;

/// Read access to stored profiles
///
/// The registry looks a profile up once per connect and keeps the snapshot.
pub trait ProfileSource: Send + Sync {
    fn get(&self, id: ProfileId) -> Option<ProfileConfig>;
}

impl ProfileSource for HashMap<ProfileId, ProfileConfig> {
    fn get(&self, id: ProfileId) -> Option<ProfileConfig> {
        HashMap::get(self, &id).cloned()
    }
}

struct RegistryInner {
    store: Arc<dyn ProfileSource>,
    sink: LogSink,
    runtime: Handle,
    poll_interval: Duration,
    active: Mutex<HashMap<ProfileId, Arc<ProcessSupervisor>>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

/// Maps profile ids to their supervisors
///
/// A profile has an entry from `connect` until its process is confirmed to
/// have exited, so an entry may be in the stopping state for a while after
/// `disconnect`. At most one supervisor exists per profile.
#[derive(Clone)]
pub struct ProfileRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("active", &self.active_ids())
            .field("poll_interval", &self.inner.poll_interval)
            .finish()
    }
}

impl ProfileRegistry {
    pub fn new(
        store: Arc<dyn ProfileSource>,
        sink: LogSink,
        runtime: Handle,
        poll_interval: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                store,
                sink,
                runtime,
                poll_interval,
                active: Mutex::new(HashMap::new()),
                event_tx,
            }),
        }
    }

    /// Subscribe to connect / disconnect / exit events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn sink(&self) -> &LogSink {
        &self.inner.sink
    }

    /// Start a supervisor for the profile unless one already exists
    ///
    /// Failures (unknown profile, unusable profile, spawn errors) are logged
    /// and never returned.
    pub fn connect(&self, id: ProfileId) {
        let mut active = self.inner.lock_active();
        if active.contains_key(&id) {
            debug!("Profile {} is already connected", id);
            return;
        }

        let Some(profile) = self.inner.store.get(id) else {
            let err = Error::ProfileNotFound(id);
            error!("Cannot connect: {}", err);
            self.inner.sink.emit(err.to_string());
            return;
        };

        let supervisor = match ProcessSupervisor::from_profile(
            &profile,
            self.inner.sink.clone(),
            self.inner.runtime.clone(),
        ) {
            Ok(supervisor) => Arc::new(supervisor),
            Err(e) => {
                error!("Cannot connect profile {}: {}", id, e);
                self.inner.sink.emit(format!("{}: {}", profile.name, e));
                return;
            }
        };

        info!("Connecting profile {} ({})", id, profile.name);
        debug!("{}: {}", profile.name, supervisor.command().display());

        let _ = self.inner.event_tx.send(RegistryEvent::Connecting { id });

        // Started under the guard: a concurrent disconnect must never see an idle entry
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        supervisor.start(self.inner.poll_interval, move |id, exit_code| {
            if let Some(inner) = registry.upgrade() {
                inner.on_supervisor_stopped(id, exit_code);
            }
        });
        active.insert(id, supervisor);
    }

    /// Ask the profile's process to terminate
    ///
    /// The entry stays until the exit is confirmed.
    pub fn disconnect(&self, id: ProfileId) {
        let Some(supervisor) = self.supervisor(id) else {
            debug!("Profile {} is not connected", id);
            return;
        };

        if !supervisor.is_active() {
            debug!("Profile {} is already stopping", id);
            return;
        }

        info!("Disconnecting profile {} ({})", id, supervisor.profile_name());
        supervisor.stop();
        let _ = self.inner.event_tx.send(RegistryEvent::StopRequested { id });
    }

    /// Connect every listed profile
    pub fn connect_autostart<I>(&self, ids: I)
    where
        I: IntoIterator<Item = ProfileId>,
    {
        for id in ids {
            self.connect(id);
        }
    }

    /// Request termination of every connected profile
    pub fn stop_all(&self) {
        for id in self.active_ids() {
            self.disconnect(id);
        }
    }

    /// Stop everything and wait for the processes to exit
    ///
    /// With a timeout, stragglers are killed once it elapses. Returns true
    /// when the registry ended up empty.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.stop_all();

        if let Some(timeout) = timeout {
            if self.wait_until_idle(timeout).await {
                return true;
            }

            let remaining = self.active_ids();
            warn!(
                "{} tunnel(s) still running after {:?}, killing: {:?}",
                remaining.len(),
                timeout,
                remaining
            );
            for id in remaining {
                if let Some(supervisor) = self.supervisor(id) {
                    self.inner
                        .sink
                        .emit(format!("{}: did not stop in time, killing", supervisor.profile_name()));
                    supervisor.kill();
                }
            }

            return self.wait_until_idle(KILL_GRACE).await;
        }

        while self.active_count() > 0 {
            tokio::time::sleep(self.inner.poll_interval).await;
        }
        true
    }

    async fn wait_until_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.inner.poll_interval).await;
        }
        true
    }

    pub fn is_connected(&self, id: ProfileId) -> bool {
        self.inner.lock_active().contains_key(&id)
    }

    pub fn supervisor(&self, id: ProfileId) -> Option<Arc<ProcessSupervisor>> {
        self.inner.lock_active().get(&id).cloned()
    }

    /// Ids with a supervisor, ascending
    pub fn active_ids(&self) -> Vec<ProfileId> {
        let mut ids: Vec<ProfileId> = self.inner.lock_active().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock_active().len()
    }
}

impl RegistryInner {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<ProfileId, Arc<ProcessSupervisor>>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_supervisor_stopped(&self, id: ProfileId, exit_code: Option<i32>) {
        let removed = self.lock_active().remove(&id);
        match removed {
            Some(supervisor) => info!(
                "Profile {} ({}) stopped, exit code {:?}",
                id,
                supervisor.profile_name(),
                exit_code
            ),
            None => warn!("Stop reported for unknown profile {}", id),
        }
        let _ = self.event_tx.send(RegistryEvent::Stopped { id, exit_code });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tokio::time::{sleep, timeout};

    use crate::types::{SupervisorState, SPAWN_FAILED_EXIT_CODE};

    const WAIT: Duration = Duration::from_secs(10);
    const POLL: Duration = Duration::from_millis(20);

    fn profile(id: ProfileId, executable: &str) -> ProfileConfig {
        let mut profile = ProfileConfig::new(id, format!("tunnel{}", id));
        profile.executable = executable.to_string();
        profile.server_addr = "127.0.0.1".to_string();
        profile.server_user = "nobody".to_string();
        profile.key_file = "/dev/null".to_string();
        profile
    }

    // Stand-in for autossh that ignores its arguments
    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn registry(profiles: Vec<ProfileConfig>) -> ProfileRegistry {
        let store: HashMap<ProfileId, ProfileConfig> =
            profiles.into_iter().map(|p| (p.id, p)).collect();
        ProfileRegistry::new(Arc::new(store), LogSink::new(100), Handle::current(), POLL)
    }

    async fn next_stopped(rx: &mut broadcast::Receiver<RegistryEvent>) -> (ProfileId, Option<i32>) {
        loop {
            let event = timeout(WAIT, rx.recv())
                .await
                .expect("no stop event")
                .expect("event channel closed");
            if let RegistryEvent::Stopped { id, exit_code } = event {
                return (id, exit_code);
            }
        }
    }

    async fn wait_for_line(sink: &LogSink, needle: &str) {
        let deadline = Instant::now() + WAIT;
        while !sink.history().iter().any(|l| l.contains(needle)) {
            assert!(Instant::now() < deadline, "line '{}' never arrived", needle);
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_twice_creates_one_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tunnel", "echo up\nexec sleep 30");
        let registry = registry(vec![profile(5, &exe)]);
        let mut events = registry.subscribe();

        registry.connect(5);
        let first = registry.supervisor(5).unwrap();
        registry.connect(5);
        let second = registry.supervisor(5).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(
            timeout(WAIT, events.recv()).await.unwrap().unwrap(),
            RegistryEvent::Connecting { id: 5 }
        );

        wait_for_line(registry.sink(), "tunnel5: up").await;
        registry.disconnect(5);

        let (id, _) = next_stopped(&mut events).await;
        assert_eq!(id, 5);
        assert!(!registry.is_connected(5));
        assert_eq!(first.state(), SupervisorState::Terminated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_keeps_entry_until_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(
            dir.path(),
            "slow-exit",
            "trap 'sleep 0.3; echo bye; exit 0' TERM\necho ready\nwhile true; do sleep 0.05; done",
        );
        let registry = registry(vec![profile(5, &exe)]);
        let mut events = registry.subscribe();

        registry.connect(5);
        wait_for_line(registry.sink(), "tunnel5: ready").await;
        registry.disconnect(5);

        assert!(registry.is_connected(5));
        assert_eq!(
            registry.supervisor(5).map(|s| s.state()),
            Some(SupervisorState::Stopping)
        );

        let (id, code) = next_stopped(&mut events).await;
        assert_eq!((id, code), (5, Some(0)));
        assert!(!registry.is_connected(5));
        assert!(registry.sink().history().iter().any(|l| l == "tunnel5: bye"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_right_after_connect() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "quiet", "exec sleep 30");
        let registry = registry(vec![profile(5, &exe)]);
        let mut events = registry.subscribe();

        registry.connect(5);
        registry.disconnect(5);

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::Connecting { id: 5 }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::StopRequested { id: 5 }
        );
        let (id, _) = next_stopped(&mut events).await;
        assert_eq!(id, 5);
        assert!(!registry.is_connected(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_racing_connect_is_never_lost() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tunnel", "exec sleep 30");
        let registry = registry(vec![profile(5, &exe)]);
        let mut events = registry.subscribe();

        for round in 0..25 {
            let connector = registry.clone();
            let connecting = std::thread::spawn(move || connector.connect(5));

            let deadline = std::time::Instant::now() + WAIT;
            while !registry.is_connected(5) {
                assert!(std::time::Instant::now() < deadline, "round {} never connected", round);
                std::thread::yield_now();
            }
            registry.disconnect(5);
            connecting.join().unwrap();

            let (id, _) = next_stopped(&mut events).await;
            assert_eq!(id, 5, "round {}", round);
            assert!(!registry.is_connected(5), "round {}", round);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_binary_stops_once_with_spawn_failure() {
        let registry = registry(vec![profile(2, "/nonexistent/autossh")]);
        let mut events = registry.subscribe();

        registry.connect(2);
        let (id, code) = next_stopped(&mut events).await;

        assert_eq!(id, 2);
        assert_eq!(code, Some(SPAWN_FAILED_EXIT_CODE));
        assert!(!registry.is_connected(2));
        wait_for_line(registry.sink(), "Failed to spawn").await;

        // Only one stop is ever reported for the attempt
        assert!(timeout(Duration::from_millis(200), next_stopped(&mut events))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exit_code_is_reported() {
        let registry = registry(vec![profile(3, "false")]);
        let mut events = registry.subscribe();

        registry.connect(3);
        assert_eq!(next_stopped(&mut events).await, (3, Some(1)));
        assert!(registry.active_ids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_profile_is_logged() {
        let registry = registry(Vec::new());
        registry.connect(42);

        assert!(!registry.is_connected(42));
        assert_eq!(
            registry.sink().history(),
            vec!["No SSH profile with id 42".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unusable_profile_is_not_started() {
        let mut broken = profile(4, "autossh");
        broken.key_file = String::new();
        let registry = registry(vec![broken]);

        registry.connect(4);

        assert_eq!(registry.active_count(), 0);
        let history = registry.sink().history();
        assert_eq!(history.len(), 1);
        assert!(history[0].starts_with("tunnel4: Configuration error"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_unknown_is_noop() {
        let registry = registry(Vec::new());
        let mut events = registry.subscribe();
        registry.disconnect(9);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_kills_stubborn_processes() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(
            dir.path(),
            "stubborn",
            "trap '' TERM\necho ready\nwhile true; do sleep 0.05; done",
        );
        let plain = script(dir.path(), "plain", "echo ready\nexec sleep 30");
        let registry = registry(vec![profile(1, &exe), profile(2, &plain)]);

        registry.connect_autostart([1, 2]);
        wait_for_line(registry.sink(), "tunnel1: ready").await;
        wait_for_line(registry.sink(), "tunnel2: ready").await;
        assert_eq!(registry.active_ids(), vec![1, 2]);

        let stopped = timeout(WAIT, registry.shutdown(Some(Duration::from_millis(300))))
            .await
            .unwrap();

        assert!(stopped);
        assert_eq!(registry.active_count(), 0);
        assert!(registry
            .sink()
            .history()
            .iter()
            .any(|l| l == "tunnel1: did not stop in time, killing"));
    }
}
