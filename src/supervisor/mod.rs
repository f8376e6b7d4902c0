pub mod error;
pub mod log_sink;
pub mod monitor;
pub mod process;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::profile::{Profile, ProfileStore, StoreError};
use crate::resource::{ResourceSampler, ResourceUsage};

pub use error::{LaunchError, MonitorError, SupervisorError};
pub use log_sink::{LogLine, LogSource, DEFAULT_LOG_BUFFER};
pub use monitor::{MonitorSnapshot, ProcessMonitor, StopOutcome, StopProgress};
pub use process::ExitInfo;
pub use state_machine::Phase;

const DEFAULT_CONSOLE_LINES: usize = 100;

/// Timing knobs shared by every monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorSettings {
    /// Wait after SIGTERM before escalating to SIGKILL
    pub stop_grace: Duration,
    /// Wait after SIGKILL before giving up
    pub kill_wait: Duration,
    /// Upper bound for stopping everything on shutdown
    pub shutdown_grace: Duration,
    /// How long to keep reading output after the child exited
    pub drain_timeout: Duration,
    pub log_buffer_lines: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            kill_wait: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(20),
            drain_timeout: Duration::from_secs(2),
            log_buffer_lines: DEFAULT_LOG_BUFFER,
        }
    }
}

/// Result of `stop_profile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopRequest {
    /// Nothing left to wait for
    Done { outcome: StopOutcome },
    /// Terminate signal sent; the monitor finishes (and escalates) in the background
    Stopping { pid: u32 },
}

/// What happened to each profile during `shutdown`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub graceful: Vec<String>,
    pub forced: Vec<String>,
    /// Idle already, or only a pending start/restart had to be cancelled
    pub already_idle: Vec<String>,
    /// (profile, reason)
    pub failed: Vec<(String, String)>,
    /// Still stopping when the shutdown grace period ran out
    pub timed_out: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// Owns one monitor per profile and the profile store.
pub struct Supervisor {
    /// Load order is preserved.
    monitors: RwLock<Vec<ProcessMonitor>>,
    /// Serialises registry mutations together with their persistence.
    store: Mutex<ProfileStore>,
    settings: SupervisorSettings,
    log_dir: PathBuf,
    sampler: ResourceSampler,
    /// Staggered startup delays are measured from here.
    epoch: Instant,
}

impl Supervisor {
    pub fn new(store: ProfileStore, settings: SupervisorSettings) -> Self {
        let log_dir = store.log_dir();
        Self {
            monitors: RwLock::new(Vec::new()),
            store: Mutex::new(store),
            settings,
            log_dir,
            sampler: ResourceSampler::new(),
            epoch: Instant::now(),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Load the profile store and register (and schedule) every profile.
    /// Returns the number of registered profiles.
    pub async fn initialize(&self) -> Result<usize, SupervisorError> {
        let profiles = {
            let store = self.store.lock().await;
            match store.load() {
                Ok(profiles) => profiles,
                Err(e @ StoreError::Corrupt { .. }) => {
                    tracing::error!("{}; starting with no profiles", e);
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            }
        };
        Ok(self.load_profiles(profiles))
    }

    /// Register `profiles` in order and schedule the auto-start ones at
    /// `epoch + startup_delay`. Returns without waiting for any start.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load_profiles(&self, profiles: Vec<Profile>) -> usize {
        let mut registered = 0;
        for profile in profiles {
            if let Err(reason) = profile.validate() {
                tracing::warn!("Skipping invalid profile: {}", reason);
                continue;
            }
            let monitor = {
                let mut monitors = self.write_monitors();
                if monitors.iter().any(|m| m.name() == profile.name) {
                    tracing::warn!("Skipping duplicate profile '{}'", profile.name);
                    continue;
                }
                let monitor = ProcessMonitor::new(profile, &self.log_dir, self.settings);
                monitors.push(monitor.clone());
                monitor
            };
            registered += 1;

            let profile = monitor.profile();
            if profile.auto_start && !profile.enabled {
                tracing::info!("'{}' is disabled, not auto-starting", profile.name);
            } else if profile.auto_start {
                let delay = profile.startup_delay();
                tracing::info!("'{}' will auto-start after {:?}", profile.name, delay);
                monitor.schedule_start(self.epoch + delay);
            }
        }
        tracing::info!("Registered {} profiles", registered);
        registered
    }

    // ─── Lifecycle ──────────────────────────────────────────

    pub async fn start_profile(&self, name: &str) -> Result<MonitorSnapshot, SupervisorError> {
        let monitor = self.find_enabled(name)?;
        monitor.start().await?;
        Ok(monitor.snapshot())
    }

    /// Returns once the stop has been initiated. Waiting for the exit and
    /// escalating to a kill happen on a background task.
    pub async fn stop_profile(&self, name: &str) -> Result<StopRequest, SupervisorError> {
        let monitor = self.find(name)?;
        match monitor.begin_stop().await? {
            StopProgress::Finished(outcome) => Ok(StopRequest::Done { outcome }),
            StopProgress::Signalled(pending) => {
                let pid = pending.pid();
                let name = name.to_string();
                tokio::spawn(async move {
                    match pending.finish().await {
                        Ok(outcome) => tracing::debug!("'{}' stop finished: {:?}", name, outcome),
                        Err(e) => tracing::error!("Stopping '{}' failed: {}", name, e),
                    }
                });
                Ok(StopRequest::Stopping { pid })
            }
        }
    }

    /// Stop (waiting for the exit) and start again.
    pub async fn restart_profile(&self, name: &str) -> Result<MonitorSnapshot, SupervisorError> {
        let monitor = self.find_enabled(name)?;
        let stopped = monitor.restart().await?;
        tracing::info!("'{}' restarted (previous stop: {:?})", name, stopped);
        Ok(monitor.snapshot())
    }

    // ─── Registry ───────────────────────────────────────────

    /// Register and persist a new profile. An empty log path is filled with
    /// the per-profile default before saving.
    pub async fn add_profile(&self, profile: Profile) -> Result<Profile, SupervisorError> {
        profile.validate().map_err(SupervisorError::InvalidProfile)?;
        let profile = profile.with_default_log_path(&self.log_dir);

        let store = self.store.lock().await;
        {
            let mut monitors = self.write_monitors();
            if monitors.iter().any(|m| m.name() == profile.name) {
                return Err(SupervisorError::ProfileExists(profile.name));
            }
            monitors.push(ProcessMonitor::new(profile.clone(), &self.log_dir, self.settings));
        }

        if let Err(e) = self.persist(&store) {
            self.write_monitors().retain(|m| m.name() != profile.name);
            return Err(e.into());
        }
        tracing::info!("Added profile '{}'", profile.name);
        Ok(profile)
    }

    /// Replace `name`'s profile. The monitor must be idle and the name cannot change.
    pub async fn update_profile(
        &self,
        name: &str,
        profile: Profile,
    ) -> Result<Profile, SupervisorError> {
        if profile.name != name {
            return Err(SupervisorError::InvalidProfile(format!(
                "profile name cannot be changed ('{}' -> '{}')",
                name, profile.name
            )));
        }
        profile.validate().map_err(SupervisorError::InvalidProfile)?;
        let profile = profile.with_default_log_path(&self.log_dir);

        let store = self.store.lock().await;
        let monitor = self.find(name)?;
        let previous = monitor.update_profile(profile.clone()).map_err(in_use)?;

        if let Err(e) = self.persist(&store) {
            if let Err(restore) = monitor.update_profile((*previous).clone()) {
                tracing::error!("Failed to restore profile '{}': {}", name, restore);
            }
            return Err(e.into());
        }
        tracing::info!("Updated profile '{}'", name);
        Ok(profile)
    }

    /// Unregister and forget `name`. The monitor must be idle.
    pub async fn remove_profile(&self, name: &str) -> Result<Profile, SupervisorError> {
        let store = self.store.lock().await;
        let monitor = self.find(name)?;
        monitor.retire().map_err(in_use)?;

        let index = {
            let mut monitors = self.write_monitors();
            let index = monitors.iter().position(|m| m.name() == name);
            if let Some(index) = index {
                monitors.remove(index);
            }
            index
        };

        if let Err(e) = self.persist(&store) {
            monitor.reinstate();
            let mut monitors = self.write_monitors();
            let index = index.unwrap_or(monitors.len()).min(monitors.len());
            monitors.insert(index, monitor);
            return Err(e.into());
        }
        tracing::info!("Removed profile '{}'", name);
        Ok((*monitor.profile()).clone())
    }

    // ─── Queries ────────────────────────────────────────────

    pub fn profiles(&self) -> Vec<Profile> {
        self.read_monitors()
            .iter()
            .map(|m| (*m.profile()).clone())
            .collect()
    }

    pub fn profile(&self, name: &str) -> Result<Profile, SupervisorError> {
        Ok((*self.find(name)?.profile()).clone())
    }

    pub fn snapshot(&self, name: &str) -> Result<MonitorSnapshot, SupervisorError> {
        Ok(self.find(name)?.snapshot())
    }

    pub fn snapshot_all(&self) -> Vec<MonitorSnapshot> {
        self.read_monitors().iter().map(|m| m.snapshot()).collect()
    }

    /// Best-effort usage of the profile's process tree; unavailable when
    /// nothing is running.
    pub async fn resource_usage(&self, name: &str) -> Result<ResourceUsage, SupervisorError> {
        let snapshot = self.find(name)?.snapshot();
        match (snapshot.phase, snapshot.pid) {
            (Phase::Running | Phase::Stopping, Some(pid)) => Ok(self.sampler.sample_async(pid).await),
            _ => Ok(ResourceUsage::unavailable()),
        }
    }

    /// Captured output. With `since`, lines newer than that id; otherwise the
    /// most recent lines. `count` caps either form.
    pub fn recent_output(
        &self,
        name: &str,
        since: Option<u64>,
        count: Option<usize>,
    ) -> Result<Vec<LogLine>, SupervisorError> {
        let monitor = self.find(name)?;
        let count = count.unwrap_or(DEFAULT_CONSOLE_LINES);
        let lines = match since {
            Some(id) => {
                let mut lines = monitor.output_since(id);
                let excess = lines.len().saturating_sub(count);
                lines.drain(..excess);
                lines
            }
            None => monitor.recent_output(count),
        };
        Ok(lines)
    }

    // ─── Shutdown ───────────────────────────────────────────

    /// Stop every profile concurrently, bounded by the shutdown grace period.
    /// One profile failing never prevents the others from being stopped.
    /// Stopped monitors are retired so nothing restarts afterwards.
    pub async fn shutdown(&self) -> ShutdownReport {
        let monitors = self.read_monitors().clone();
        tracing::info!("Shutting down {} profiles", monitors.len());

        let mut pending: BTreeSet<String> = BTreeSet::new();
        let mut tasks = JoinSet::new();
        for monitor in monitors {
            let name = monitor.name().to_string();
            pending.insert(name.clone());
            tasks.spawn(async move {
                let result = monitor.stop().await;
                if result.is_ok() {
                    if let Err(e) = monitor.retire() {
                        tracing::debug!("'{}' not retired: {}", name, e);
                    }
                }
                (name, result)
            });
        }

        let deadline = Instant::now() + self.settings.shutdown_grace;
        let mut report = ShutdownReport::default();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((name, result)))) => {
                    pending.remove(&name);
                    match result {
                        Ok(StopOutcome::Graceful) => report.graceful.push(name),
                        Ok(StopOutcome::Forced) => report.forced.push(name),
                        Ok(StopOutcome::AlreadyIdle | StopOutcome::Cancelled) => {
                            report.already_idle.push(name)
                        }
                        Err(e) => {
                            tracing::error!("Failed to stop '{}': {}", name, e);
                            report.failed.push((name, e.to_string()));
                        }
                    }
                }
                Ok(Some(Err(e))) => tracing::error!("Shutdown task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Shutdown grace period ({:?}) elapsed with {} profiles still stopping",
                        self.settings.shutdown_grace,
                        pending.len()
                    );
                    tasks.detach_all();
                    report.timed_out = std::mem::take(&mut pending).into_iter().collect();
                    break;
                }
            }
        }
        // Tasks that panicked never reported a name.
        for name in pending {
            report.failed.push((name, "stop task panicked".to_string()));
        }

        tracing::info!(
            "Shutdown complete: {} graceful, {} forced, {} idle, {} failed, {} timed out",
            report.graceful.len(),
            report.forced.len(),
            report.already_idle.len(),
            report.failed.len(),
            report.timed_out.len()
        );
        report
    }

    // ─── Helpers ────────────────────────────────────────────

    fn find(&self, name: &str) -> Result<ProcessMonitor, SupervisorError> {
        self.read_monitors()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| SupervisorError::ProfileNotFound(name.to_string()))
    }

    /// Caller must hold the store lock.
    fn find_enabled(&self, name: &str) -> Result<ProcessMonitor, SupervisorError> {
        let monitor = self.find(name)?;
        if !monitor.profile().enabled {
            return Err(SupervisorError::ProfileDisabled(name.to_string()));
        }
        Ok(monitor)
    }

    fn persist(&self, store: &ProfileStore) -> Result<(), StoreError> {
        store.save(&self.profiles())
    }

    fn read_monitors(&self) -> RwLockReadGuard<'_, Vec<ProcessMonitor>> {
        self.monitors.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_monitors(&self) -> RwLockWriteGuard<'_, Vec<ProcessMonitor>> {
        self.monitors.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn in_use(err: MonitorError) -> SupervisorError {
    match err {
        MonitorError::AlreadyActive { name, phase } => SupervisorError::ProfileInUse { name, phase },
        other => other.into(),
    }
}
