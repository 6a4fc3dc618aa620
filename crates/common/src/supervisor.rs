// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Autossh Tray Contributors

// Autossh Tray - Process Supervisor
// Spawns one tunnel process in its own process group, pumps its output into
// the log sink, detects termination and tears the group down.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::command::{build_command, TunnelCommand};
use crate::config::ProfileConfig;
use crate::error::{Error, Result};
use crate::log_sink::{LogPayload, LogSink};
use crate::types::{ProfileId, SupervisorState, SPAWN_FAILED_EXIT_CODE};

/// Minimum time to wait for trailing output once the process has exited
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Signals the supervisor can deliver to a process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Terminate,
    Kill,
}

#[derive(Debug)]
struct Control {
    state: SupervisorState,
    /// Child pid, which is also its process group id
    pid: Option<u32>,
    stop_requested: bool,
}

/// Everything the background task needs, detached from the supervisor handle
#[derive(Clone)]
struct PumpContext {
    profile_id: ProfileId,
    profile_name: String,
    command: TunnelCommand,
    sink: LogSink,
    control: Arc<Mutex<Control>>,
    poll_interval: Duration,
}

/// Owns at most one external tunnel process
///
/// `start` and `stop` never block and never fail; every problem ends up as a
/// log line plus the regular transition to `Terminated` and one call of the
/// stop callback.
pub struct ProcessSupervisor {
    profile_id: ProfileId,
    profile_name: String,
    command: TunnelCommand,
    sink: LogSink,
    runtime: Handle,
    control: Arc<Mutex<Control>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let control = self.lock();
        f.debug_struct("ProcessSupervisor")
            .field("profile_id", &self.profile_id)
            .field("profile_name", &self.profile_name)
            .field("state", &control.state)
            .field("pid", &control.pid)
            .finish()
    }
}

impl ProcessSupervisor {
    /// Create an idle supervisor for an already built command
    pub fn new(
        profile: &ProfileConfig,
        command: TunnelCommand,
        sink: LogSink,
        runtime: Handle,
    ) -> Self {
        Self {
            profile_id: profile.id,
            profile_name: profile.name.clone(),
            command,
            sink,
            runtime,
            control: Arc::new(Mutex::new(Control {
                state: SupervisorState::Idle,
                pid: None,
                stop_requested: false,
            })),
        }
    }

    /// Create an idle supervisor, building the command from the profile
    pub fn from_profile(profile: &ProfileConfig, sink: LogSink, runtime: Handle) -> Result<Self> {
        let command = build_command(profile)?;
        Ok(Self::new(profile, command, sink, runtime))
    }

    pub fn profile_id(&self) -> ProfileId {
        self.profile_id
    }

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    pub fn command(&self) -> &TunnelCommand {
        &self.command
    }

    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    /// Pid (and process group id) of the live process, if any
    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// True while starting or running
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Spawn the process on a background task
    ///
    /// `on_stop` runs exactly once, on the background task, after the exit is
    /// confirmed and all output has been forwarded. A spawn failure reports
    /// exit code `-1`. Calling `start` more than once has no effect.
    pub fn start<F>(&self, poll_interval: Duration, on_stop: F)
    where
        F: FnOnce(ProfileId, Option<i32>) + Send + 'static,
    {
        {
            let mut control = self.lock();
            if control.state != SupervisorState::Idle {
                warn!(
                    "{}: start ignored, supervisor is {}",
                    self.profile_name, control.state
                );
                return;
            }
            control.state = SupervisorState::Starting;
        }

        info!("{}: {}", self.profile_name, self.command.display());

        let ctx = PumpContext {
            profile_id: self.profile_id,
            profile_name: self.profile_name.clone(),
            command: self.command.clone(),
            sink: self.sink.clone(),
            control: self.control.clone(),
            poll_interval: sanitize_interval(poll_interval),
        };

        let pump = self.runtime.spawn(supervise(ctx.clone()));

        self.runtime.spawn(async move {
            let exit_code = match pump.await {
                Ok(exit_code) => exit_code,
                Err(e) => {
                    let err = Error::Runtime(e.to_string());
                    error!("{}: unexpected error: {:?}", ctx.profile_name, err);
                    ctx.sink
                        .emit(format!("{}: unexpected error: {}", ctx.profile_name, err));

                    // The pump died without confirming the group is gone
                    let pid = lock_control(&ctx.control).pid;
                    if let Some(pid) = pid {
                        if let Err(e) = signal_group(pid, GroupSignal::Terminate) {
                            debug!("{}: cleanup signal failed: {}", ctx.profile_name, e);
                        }
                    }
                    None
                }
            };

            {
                let mut control = lock_control(&ctx.control);
                control.state = SupervisorState::Terminated;
                control.pid = None;
            }

            info!("{}: return code {:?}", ctx.profile_name, exit_code);
            ctx.sink.emit(format!(
                "{}: return code {}",
                ctx.profile_name,
                describe_exit_code(exit_code)
            ));

            on_stop(ctx.profile_id, exit_code);
        });
    }

    /// Request termination of the whole process group
    ///
    /// Idempotent and asynchronous: the process is only gone once the stop
    /// callback has run.
    pub fn stop(&self) {
        let pid = {
            let mut control = self.lock();
            match control.state {
                SupervisorState::Idle => {
                    debug!("{}: stop ignored, never started", self.profile_name);
                    return;
                }
                SupervisorState::Stopping | SupervisorState::Terminated => {
                    debug!(
                        "{}: stop ignored, supervisor is {}",
                        self.profile_name, control.state
                    );
                    return;
                }
                SupervisorState::Starting | SupervisorState::Running => {}
            }
            control.stop_requested = true;
            control.state = SupervisorState::Stopping;
            control.pid
        };

        info!("{}: stopping", self.profile_name);

        // Without a pid the spawn is still in flight; the pump signals the
        // group as soon as it sees stop_requested.
        if let Some(pid) = pid {
            if let Err(e) = signal_group(pid, GroupSignal::Terminate) {
                warn!("{}: failed to signal process group {}: {}", self.profile_name, pid, e);
            }
        }
    }

    /// Forcefully kill the process group (shutdown escalation only)
    pub fn kill(&self) {
        let pid = {
            let mut control = self.lock();
            if control.state == SupervisorState::Idle || control.state.is_terminated() {
                return;
            }
            control.stop_requested = true;
            control.state = SupervisorState::Stopping;
            control.pid
        };

        if let Some(pid) = pid {
            warn!("{}: killing process group {}", self.profile_name, pid);
            if let Err(e) = signal_group(pid, GroupSignal::Kill) {
                warn!("{}: failed to kill process group {}: {}", self.profile_name, pid, e);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        lock_control(&self.control)
    }
}

fn lock_control(control: &Mutex<Control>) -> MutexGuard<'_, Control> {
    control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sanitize_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        Duration::from_millis(1)
    } else {
        interval
    }
}

/// Background task body: spawn, pump, detect exit, drain. Returns the exit code.
async fn supervise(ctx: PumpContext) -> Option<i32> {
    let mut cmd = Command::new(ctx.command.program());
    cmd.args(ctx.command.args())
        .env_clear()
        .envs(ctx.command.env())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // New process group led by the child, so the group can be signalled as a whole
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = Error::Spawn {
                program: ctx.command.program().to_string(),
                source,
            };
            error!("{}: {}", ctx.profile_name, err);
            ctx.sink.emit(format!("{}: {}", ctx.profile_name, err));
            return Some(SPAWN_FAILED_EXIT_CODE);
        }
    };

    let pid = child.id();
    let stop_now = {
        let mut control = lock_control(&ctx.control);
        control.pid = pid;
        if control.state == SupervisorState::Starting {
            control.state = SupervisorState::Running;
        }
        control.stop_requested
    };

    info!("{}: started with pid {:?}", ctx.profile_name, pid);

    if stop_now {
        if let Some(pid) = pid {
            debug!("{}: stop requested during spawn", ctx.profile_name);
            if let Err(e) = signal_group(pid, GroupSignal::Terminate) {
                warn!("{}: failed to signal process group {}: {}", ctx.profile_name, pid, e);
            }
        }
    }

    // Keep stdin open for the lifetime of the process
    let _stdin = child.stdin.take();

    // stdout and stderr are merged into a single line stream
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(stdout, line_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(stderr, line_tx.clone())));
    }
    drop(line_tx);

    let status = pump_until_exit(&ctx, &mut child, &mut line_rx).await;

    // Everything produced up to the confirmed exit still reaches the sink
    let grace = ctx.poll_interval.max(DRAIN_GRACE);
    loop {
        match tokio::time::timeout(grace, line_rx.recv()).await {
            Ok(Some(line)) => forward_line(&ctx, line),
            Ok(None) => break,
            Err(_) => {
                debug!("{}: output still open after exit, stop draining", ctx.profile_name);
                break;
            }
        }
    }
    for reader in readers {
        reader.abort();
    }
    drop(line_rx);

    // Helpers forked by the process may still hold the group alive. The group
    // id stays reserved while any member lives; once the group is empty the
    // only reuse risk is the short window since the leader was reaped.
    if let Some(pid) = pid {
        match signal_group(pid, GroupSignal::Terminate) {
            Ok(()) => debug!("{}: terminated leftover group members", ctx.profile_name),
            Err(e) => debug!("{}: process group already gone: {}", ctx.profile_name, e),
        }
    }

    match status {
        Ok(status) => exit_code_of(&ctx, status),
        Err(err) => {
            error!("{}: unexpected error: {:?}", ctx.profile_name, err);
            ctx.sink
                .emit(format!("{}: unexpected error: {}", ctx.profile_name, err));
            None
        }
    }
}

/// Forward output and poll liveness every `poll_interval` until the process exits
async fn pump_until_exit(
    ctx: &PumpContext,
    child: &mut Child,
    line_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<ExitStatus> {
    let mut ticker = tokio::time::interval(ctx.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(line) = line_rx.recv() => forward_line(ctx, line),
            _ = ticker.tick() => {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        // The leader is reaped; its pid may be handed out again
                        lock_control(&ctx.control).pid = None;
                        return Ok(status);
                    }
                    Ok(None) => kill_leaf_if_stopping(ctx, child),
                    Err(e) => {
                        // Liveness is unknown: tear the group down and wait for the leaf
                        if let Some(pid) = child.id() {
                            let _ = signal_group(pid, GroupSignal::Kill);
                        }
                        let _ = child.start_kill();
                        let _ = tokio::time::timeout(DRAIN_GRACE, child.wait()).await;
                        return Err(Error::Runtime(format!("failed to poll process: {}", e)));
                    }
                }
            }
        }
    }
}

// Process groups are signalled directly by stop(); nothing to do here
#[cfg(unix)]
fn kill_leaf_if_stopping(_ctx: &PumpContext, _child: &mut Child) {}

#[cfg(not(unix))]
fn kill_leaf_if_stopping(ctx: &PumpContext, child: &mut Child) {
    if lock_control(&ctx.control).stop_requested {
        let _ = child.start_kill();
    }
}

async fn read_lines<R>(reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output pipe read failed: {}", e);
                break;
            }
        }
    }
}

fn forward_line(ctx: &PumpContext, line: Vec<u8>) {
    let payload = LogPayload::parts([
        LogPayload::Text(format!("{}:", ctx.profile_name)),
        LogPayload::Bytes(line),
    ]);
    let formatted = ctx.sink.emit(payload);
    debug!(target: "autossh_tray_common::output", "{}", formatted);
}

fn exit_code_of(ctx: &PumpContext, status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            info!("{}: terminated by signal {}", ctx.profile_name, signal);
            ctx.sink
                .emit(format!("{}: terminated by signal {}", ctx.profile_name, signal));
        }
    }

    None
}

fn describe_exit_code(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}

/// Deliver a signal to the process group led by `pid`
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: GroupSignal) -> std::io::Result<()> {
    // kill(-1) and kill(-0) would hit every process we may signal / our own group
    if pid <= 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {}", pid),
        ));
    }
    let pgid = libc::pid_t::try_from(pid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
    })?;
    let signo = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };

    let result = unsafe { libc::kill(-pgid, signo) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: GroupSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}
