//! Process Monitor - owns one profile's child process lifecycle.
//!
//! A monitor launches the profile's script, watches it for exit on a
//! dedicated task, restarts it after the profile's restart-wait when it
//! exits unexpectedly, and stops it gracefully (escalating to a kill) on
//! request.
//!
//! Locking:
//! - `control` (async mutex) serialises every mutating operation, including
//!   deferred starts/restarts when they fire. It may be held across awaits.
//! - `state` (std mutex) guards the snapshot fields. It is only held for
//!   short synchronous sections, so `snapshot()` never waits on a launch,
//!   a stop or the watch task.
//! The watch task never takes `control`, so a stop waiting for exit under
//! `control` cannot deadlock against it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{LaunchError, MonitorError};
use super::log_sink::{LogLine, LogSink, LogTail, LogWriter};
use super::process::{self, current_timestamp, ExitInfo};
use super::state_machine::{Phase, StateMachine, TransitionError};
use super::SupervisorSettings;
use crate::profile::Profile;

/// Read-only copy of a monitor's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub name: String,
    pub phase: Phase,
    pub pid: Option<u32>,
    pub last_exit: Option<ExitInfo>,
    /// Unexpected exits since the last explicit or staggered start
    pub restart_count: u32,
    /// Unix timestamp (seconds) of the current/last launch
    pub started_at: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub last_error: Option<String>,
    /// A deferred start or restart is waiting to fire
    pub start_scheduled: bool,
}

/// How a stop request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was running or scheduled
    AlreadyIdle,
    /// A pending start or restart was cancelled; no process was running
    Cancelled,
    /// The child exited after the terminate signal
    Graceful,
    /// The child had to be killed after the grace period
    Forced,
}

/// Result of the first half of a stop.
pub enum StopProgress {
    Finished(StopOutcome),
    /// The child has been signalled; `finish` waits for it and escalates.
    Signalled(PendingStop),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchCause {
    Explicit,
    Startup,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeferredKind {
    Startup,
    Restart,
}

struct MonitorState {
    machine: StateMachine,
    pid: Option<u32>,
    last_exit: Option<ExitInfo>,
    restart_count: u32,
    started_at: Option<u64>,
    last_error: Option<String>,
    /// Bumped on every launch; the watch task only records exits for its own incarnation.
    incarnation: u64,
    /// `false` once the current child has been reaped
    alive_rx: Option<watch::Receiver<bool>>,
    /// Marker writer for the current incarnation's log file
    writer: Option<LogWriter>,
    /// Cancels the pending deferred start/restart
    deferred: Option<CancellationToken>,
    retired: bool,
}

struct MonitorInner {
    name: String,
    profile: RwLock<Arc<Profile>>,
    log_dir: std::path::PathBuf,
    settings: SupervisorSettings,
    control: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<MonitorState>,
    phase_tx: watch::Sender<Phase>,
    sink: LogSink,
}

/// Handle to a profile's monitor. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ProcessMonitor {
    inner: Arc<MonitorInner>,
}

impl ProcessMonitor {
    pub fn new(profile: Profile, log_dir: &Path, settings: SupervisorSettings) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            inner: Arc::new(MonitorInner {
                name: profile.name.clone(),
                profile: RwLock::new(Arc::new(profile)),
                log_dir: log_dir.to_path_buf(),
                settings,
                control: Arc::new(tokio::sync::Mutex::new(())),
                state: Mutex::new(MonitorState {
                    machine: StateMachine::new(),
                    pid: None,
                    last_exit: None,
                    restart_count: 0,
                    started_at: None,
                    last_error: None,
                    incarnation: 0,
                    alive_rx: None,
                    writer: None,
                    deferred: None,
                    retired: false,
                }),
                phase_tx,
                sink: LogSink::new(settings.log_buffer_lines),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn profile(&self) -> Arc<Profile> {
        self.inner.current_profile()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock_state().machine.phase()
    }

    /// Subscribe to phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase_tx.subscribe()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let st = self.inner.lock_state();
        let uptime_secs = match (st.machine.phase(), st.started_at) {
            (Phase::Running | Phase::Stopping, Some(started)) => {
                Some(current_timestamp().saturating_sub(started))
            }
            _ => None,
        };
        MonitorSnapshot {
            name: self.inner.name.clone(),
            phase: st.machine.phase(),
            pid: st.pid,
            last_exit: st.last_exit.clone(),
            restart_count: st.restart_count,
            started_at: st.started_at,
            uptime_secs,
            last_error: st.last_error.clone(),
            start_scheduled: st.deferred.is_some(),
        }
    }

    /// Launch the script. Returns once the child has been spawned.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let _guard = self.inner.control.lock().await;
        self.inner.launch(LaunchCause::Explicit).await
    }

    /// Stop the child (or cancel a pending restart) and wait until it is gone.
    pub async fn stop(&self) -> Result<StopOutcome, MonitorError> {
        match self.begin_stop().await? {
            StopProgress::Finished(outcome) => Ok(outcome),
            StopProgress::Signalled(pending) => pending.finish().await,
        }
    }

    /// Cancel pending activity and send the terminate signal without waiting
    /// for the child to exit. The monitor stays locked until the returned
    /// [`PendingStop`] finishes (or is dropped).
    pub async fn begin_stop(&self) -> Result<StopProgress, MonitorError> {
        let guard = self.inner.control.clone().lock_owned().await;
        Ok(match self.inner.signal_stop()? {
            SignalResult::Done(outcome) => StopProgress::Finished(outcome),
            SignalResult::Signalled(pid) => {
                StopProgress::Signalled(PendingStop::new(&self.inner, pid, guard))
            }
        })
    }

    /// Stop, then start again, without letting other operations in between.
    pub async fn restart(&self) -> Result<StopOutcome, MonitorError> {
        let guard = self.inner.control.clone().lock_owned().await;
        let (stopped, _guard) = match self.inner.signal_stop()? {
            SignalResult::Done(outcome) => (outcome, guard),
            SignalResult::Signalled(pid) => {
                let (result, guard) = PendingStop::new(&self.inner, pid, guard).wait().await;
                (result?, guard)
            }
        };
        self.inner.launch(LaunchCause::Explicit).await?;
        Ok(stopped)
    }

    /// Start at `deadline` unless stopped or started explicitly before then.
    pub fn schedule_start(&self, deadline: Instant) {
        let token = CancellationToken::new();
        {
            let mut st = self.inner.lock_state();
            if st.retired || st.machine.phase() != Phase::Idle {
                tracing::debug!(
                    "[{}] not scheduling start while {}",
                    self.inner.name,
                    st.machine.phase()
                );
                return;
            }
            if let Some(previous) = st.deferred.replace(token.clone()) {
                previous.cancel();
            }
        }
        self.inner.spawn_deferred(DeferredKind::Startup, token, deadline);
    }

    /// Replace the profile. Only allowed while idle; returns the previous profile.
    ///
    /// Never waits: a monitor whose lock is held (a launch or a stop in
    /// progress) is not idle and is rejected straight away.
    pub fn update_profile(&self, profile: Profile) -> Result<Arc<Profile>, MonitorError> {
        let _guard = self.try_lock_idle()?;
        let mut slot = self
            .inner
            .profile
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::replace(&mut *slot, Arc::new(profile)))
    }

    /// Mark the monitor as removed. Only allowed while idle; cancels a scheduled start.
    pub fn retire(&self) -> Result<(), MonitorError> {
        let _guard = self.try_lock_idle()?;
        let mut st = self.inner.lock_state();
        if let Some(deferred) = st.deferred.take() {
            deferred.cancel();
        }
        st.retired = true;
        Ok(())
    }

    /// Undo `retire` (used when persisting a removal fails).
    pub fn reinstate(&self) {
        self.inner.lock_state().retired = false;
    }

    fn try_lock_idle(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, MonitorError> {
        let busy = |phase| MonitorError::AlreadyActive {
            name: self.inner.name.clone(),
            phase,
        };
        let guard = self
            .inner
            .control
            .try_lock()
            .map_err(|_| busy(self.phase()))?;
        match self.phase() {
            Phase::Idle => Ok(guard),
            phase => Err(busy(phase)),
        }
    }

    pub fn recent_output(&self, count: usize) -> Vec<LogLine> {
        self.inner.sink.recent(count)
    }

    pub fn output_since(&self, since_id: u64) -> Vec<LogLine> {
        self.inner.sink.since(since_id)
    }
}

/// Second half of a stop: bounded wait for exit, escalating to a kill.
pub struct PendingStop {
    inner: Arc<MonitorInner>,
    pid: u32,
    phase_rx: watch::Receiver<Phase>,
    guard: OwnedMutexGuard<()>,
}

impl PendingStop {
    fn new(inner: &Arc<MonitorInner>, pid: u32, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            inner: inner.clone(),
            pid,
            phase_rx: inner.phase_tx.subscribe(),
            guard,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn finish(self) -> Result<StopOutcome, MonitorError> {
        self.wait().await.0
    }

    async fn wait(mut self) -> (Result<StopOutcome, MonitorError>, OwnedMutexGuard<()>) {
        let settings = self.inner.settings;
        let name = self.inner.name.clone();

        if wait_for_idle(&mut self.phase_rx, settings.stop_grace).await {
            tracing::info!("[{}] stopped gracefully", name);
            return (Ok(StopOutcome::Graceful), self.guard);
        }

        tracing::warn!(
            "[{}] pid {} still running after {:?}, killing",
            name,
            self.pid,
            settings.stop_grace
        );
        if let Err(e) = process::force_kill(self.pid) {
            let err = MonitorError::TerminationFailed {
                name,
                pid: self.pid,
                reason: e.to_string(),
            };
            tracing::error!("{}", err);
            return (Err(err), self.guard);
        }

        if wait_for_idle(&mut self.phase_rx, settings.kill_wait).await {
            tracing::warn!("[{}] killed after grace period", name);
            return (Ok(StopOutcome::Forced), self.guard);
        }

        let err = MonitorError::TerminationFailed {
            name,
            pid: self.pid,
            reason: format!("still running {:?} after kill", settings.kill_wait),
        };
        tracing::error!("{}", err);
        (Err(err), self.guard)
    }
}

impl MonitorInner {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_profile(&self) -> Arc<Profile> {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_phase(&self, st: &mut MonitorState, to: Phase) -> Result<(), TransitionError> {
        st.machine.transition(&self.name, to)?;
        self.phase_tx.send_replace(to);
        Ok(())
    }

    /// Caller must hold `control`.
    async fn launch(self: &Arc<Self>, cause: LaunchCause) -> Result<(), MonitorError> {
        self.wait_for_previous_exit().await;

        let profile = self.current_profile();
        {
            let mut st = self.lock_state();
            if st.retired {
                return Err(MonitorError::Retired(self.name.clone()));
            }
            let phase = st.machine.phase();
            if !matches!(phase, Phase::Idle | Phase::RestartPending) {
                return Err(MonitorError::AlreadyActive {
                    name: self.name.clone(),
                    phase,
                });
            }
            if let Some(deferred) = st.deferred.take() {
                deferred.cancel();
            }
            if cause != LaunchCause::Restart {
                st.restart_count = 0;
            }
            self.set_phase(&mut st, Phase::Starting)?;
        }

        let spawned = self.spawn_child(&profile).await;

        let mut st = self.lock_state();
        match spawned {
            Ok(Spawned { child, pid, writer, tail }) => {
                let (alive_tx, alive_rx) = watch::channel(true);
                st.incarnation += 1;
                st.pid = Some(pid);
                st.started_at = Some(current_timestamp());
                st.last_error = None;
                st.alive_rx = Some(alive_rx);
                st.writer = Some(writer.clone());
                self.set_phase(&mut st, Phase::Running)?;
                let incarnation = st.incarnation;
                drop(st);

                tracing::info!("[{}] started with pid {} ({:?})", self.name, pid, cause);
                tokio::spawn(self.clone().watch_child(incarnation, child, alive_tx, writer, tail));
                Ok(())
            }
            Err(source) => {
                tracing::error!("[{}] launch failed: {}", self.name, source);
                st.last_error = Some(source.to_string());
                self.set_phase(&mut st, Phase::Idle)?;
                Err(MonitorError::Launch {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Queue behind a previous incarnation that has exited but whose exit has
    /// not been recorded yet.
    async fn wait_for_previous_exit(&self) {
        let mut phase_rx = self.phase_tx.subscribe();
        let reaped = {
            let st = self.lock_state();
            st.machine.phase() == Phase::Running
                && st.alive_rx.as_ref().is_some_and(|rx| !*rx.borrow())
        };
        if reaped {
            tracing::debug!("[{}] waiting for previous child to be recorded", self.name);
            let limit = self.settings.drain_timeout + Duration::from_secs(1);
            let recorded =
                tokio::time::timeout(limit, wait_for_phase(&mut phase_rx, |p| !p.has_child()))
                    .await
                    .unwrap_or(false);
            if !recorded {
                tracing::warn!(
                    "[{}] previous child still not recorded after {:?}",
                    self.name,
                    limit
                );
            }
        }
    }

    async fn spawn_child(&self, profile: &Profile) -> Result<Spawned, LaunchError> {
        let script = profile.script_path.clone();
        if !script.is_file() {
            return Err(LaunchError::ScriptNotFound(script));
        }
        if profile.interpreter.is_none() && !is_executable(&script) {
            return Err(LaunchError::NotExecutable(script));
        }
        let working_dir = profile.effective_working_dir();
        if !working_dir.is_dir() {
            return Err(LaunchError::WorkingDirMissing(working_dir));
        }

        let log_path = profile.effective_log_path(&self.log_dir);
        let log_error = |source| LaunchError::LogFile {
            path: log_path.clone(),
            source,
        };
        let writer = self.sink.open(&log_path).await.map_err(log_error)?;
        // The child owns its own append handle, so it can outlive the daemon.
        let stdout = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .map_err(log_error)?;
        let stderr = stdout.try_clone().map_err(log_error)?;
        let offset = stdout.metadata().map_err(log_error)?.len();

        let mut std_cmd = match &profile.interpreter {
            Some(interpreter) => {
                let mut cmd = std::process::Command::new(interpreter);
                cmd.arg(&script);
                cmd
            }
            None => std::process::Command::new(&script),
        };
        std_cmd
            .current_dir(&working_dir)
            .envs(profile.environment.iter().map(|v| (&v.key, &v.value)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // Own process group, so signals reach everything the script forks.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(false);
        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            path: script.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(LaunchError::Spawn {
                path: script,
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "child was reaped before its pid was read",
                ),
            });
        };

        let tail = self.sink.follow(&log_path, offset);
        writer
            .mark(&format!("started {} (pid {})", script.display(), pid))
            .await;
        Ok(Spawned {
            child,
            pid,
            writer,
            tail,
        })
    }

    async fn watch_child(
        self: Arc<Self>,
        incarnation: u64,
        mut child: Child,
        alive_tx: watch::Sender<bool>,
        writer: LogWriter,
        tail: LogTail,
    ) {
        let exit = match child.wait().await {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => {
                tracing::error!("[{}] failed to wait for child: {}", self.name, e);
                ExitInfo::unknown()
            }
        };
        let _ = alive_tx.send(false);

        writer.mark(&format!("exited with {}", exit)).await;
        drop(writer);
        if !tail.finish(self.settings.drain_timeout).await {
            tracing::debug!("[{}] log tail did not catch up after exit", self.name);
        }

        self.record_exit(incarnation, exit);
    }

    fn record_exit(self: &Arc<Self>, incarnation: u64, exit: ExitInfo) {
        let profile = self.current_profile();
        let mut st = self.lock_state();
        if st.incarnation != incarnation {
            tracing::error!("[{}] exit reported for a stale incarnation", self.name);
            return;
        }
        st.pid = None;
        st.alive_rx = None;
        st.writer = None;
        st.last_exit = Some(exit.clone());

        let result = match st.machine.phase() {
            Phase::Stopping => {
                tracing::info!("[{}] exited after stop request ({})", self.name, exit);
                self.set_phase(&mut st, Phase::Idle)
            }
            Phase::Running if profile.restart_on_exit => {
                st.restart_count += 1;
                let wait = profile.restart_wait();
                tracing::warn!(
                    "[{}] exited unexpectedly ({}), restart #{} in {:?}",
                    self.name,
                    exit,
                    st.restart_count,
                    wait
                );
                let token = CancellationToken::new();
                st.deferred = Some(token.clone());
                let result = self.set_phase(&mut st, Phase::RestartPending);
                if result.is_ok() {
                    self.spawn_deferred(DeferredKind::Restart, token, Instant::now() + wait);
                }
                result
            }
            Phase::Running => {
                tracing::info!("[{}] exited ({}), restart disabled", self.name, exit);
                self.set_phase(&mut st, Phase::Idle)
            }
            phase => Err(TransitionError::InvalidTransition(phase, Phase::Idle)),
        };
        if let Err(e) = result {
            tracing::error!("[{}] failed to record exit: {}", self.name, e);
        }
    }

    fn spawn_deferred(
        self: &Arc<Self>,
        kind: DeferredKind,
        token: CancellationToken,
        deadline: Instant,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let _guard = inner.control.lock().await;
            {
                // A stop or explicit start may have run while we waited for the lock.
                let mut st = inner.lock_state();
                if token.is_cancelled() {
                    return;
                }
                st.deferred = None;
            }

            let cause = match kind {
                DeferredKind::Startup => LaunchCause::Startup,
                DeferredKind::Restart => LaunchCause::Restart,
            };
            if let Err(e) = inner.launch(cause).await {
                tracing::error!("[{}] deferred {:?} failed: {}", inner.name, kind, e);
            }
        });
    }

    /// Cancel deferred work and signal the child. Caller must hold `control`.
    fn signal_stop(&self) -> Result<SignalResult, MonitorError> {
        let pid = {
            let mut st = self.lock_state();
            let cancelled = match st.deferred.take() {
                Some(deferred) => {
                    deferred.cancel();
                    true
                }
                None => false,
            };
            match st.machine.phase() {
                Phase::Idle => {
                    let outcome = if cancelled {
                        tracing::info!("[{}] scheduled start cancelled", self.name);
                        StopOutcome::Cancelled
                    } else {
                        StopOutcome::AlreadyIdle
                    };
                    return Ok(SignalResult::Done(outcome));
                }
                Phase::RestartPending => {
                    self.set_phase(&mut st, Phase::Idle)?;
                    tracing::info!("[{}] pending restart cancelled", self.name);
                    return Ok(SignalResult::Done(StopOutcome::Cancelled));
                }
                Phase::Starting | Phase::Running => {
                    self.set_phase(&mut st, Phase::Stopping)?;
                }
                // A previous stop gave up after a failed kill; try again.
                Phase::Stopping => {}
            }
            st.pid
        };

        let Some(pid) = pid else {
            return Err(MonitorError::TerminationFailed {
                name: self.name.clone(),
                pid: 0,
                reason: "no process id recorded".into(),
            });
        };

        tracing::info!("[{}] stopping pid {}", self.name, pid);
        if let Err(e) = process::terminate(pid) {
            tracing::warn!("[{}] {}", self.name, e);
        }
        Ok(SignalResult::Signalled(pid))
    }
}

enum SignalResult {
    Done(StopOutcome),
    Signalled(u32),
}

struct Spawned {
    child: Child,
    pid: u32,
    writer: LogWriter,
    tail: LogTail,
}

async fn wait_for_phase(rx: &mut watch::Receiver<Phase>, done: impl Fn(Phase) -> bool) -> bool {
    loop {
        let phase = *rx.borrow_and_update();
        if done(phase) {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

async fn wait_for_idle(rx: &mut watch::Receiver<Phase>, limit: Duration) -> bool {
    tokio::time::timeout(limit, wait_for_phase(rx, |p| p == Phase::Idle))
        .await
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
