use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::{SupervisorSettings, DEFAULT_LOG_BUFFER};

const DEFAULT_CONFIG_PATH: &str = "config/global.toml";
const DEFAULT_IPC_LISTEN: &str = "127.0.0.1:57480";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Profile store and default log location. `RUNSH_DATA_DIR` overrides it.
    pub data_dir: Option<PathBuf>,
    pub ipc_listen: String,
    pub log_level: String,
    /// Stop every script when the daemon exits. When false they keep running
    /// in their own process groups.
    pub stop_on_exit: bool,
    pub supervisor: SupervisorConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            ipc_listen: DEFAULT_IPC_LISTEN.to_string(),
            log_level: "info".to_string(),
            stop_on_exit: true,
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// `[supervisor]` table
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub stop_grace_secs: f64,
    pub kill_wait_secs: f64,
    pub shutdown_grace_secs: f64,
    pub drain_timeout_secs: f64,
    pub log_buffer_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: 10.0,
            kill_wait_secs: 5.0,
            shutdown_grace_secs: 20.0,
            drain_timeout_secs: 2.0,
            log_buffer_lines: DEFAULT_LOG_BUFFER,
        }
    }
}

impl GlobalConfig {
    /// Read `$RUNSH_CONFIG` (or `config/global.toml`). A missing file gives
    /// the defaults; a malformed one is an error.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os("RUNSH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let cfg = Self::parse(&s).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.supervisor.validate()?;
        Ok(cfg)
    }

    /// `RUNSH_DATA_DIR`, then `data_dir`, then `$HOME/.local/share/run_sh_manager`.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os("RUNSH_DATA_DIR") {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".local").join("share").join("run_sh_manager")
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let s = &self.supervisor;
        SupervisorSettings {
            stop_grace: Duration::from_secs_f64(s.stop_grace_secs),
            kill_wait: Duration::from_secs_f64(s.kill_wait_secs),
            shutdown_grace: Duration::from_secs_f64(s.shutdown_grace_secs),
            drain_timeout: Duration::from_secs_f64(s.drain_timeout_secs),
            log_buffer_lines: s.log_buffer_lines.max(1),
        }
    }
}

impl SupervisorConfig {
    fn validate(&self) -> anyhow::Result<()> {
        for (field, secs) in [
            ("stop_grace_secs", self.stop_grace_secs),
            ("kill_wait_secs", self.kill_wait_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
            ("drain_timeout_secs", self.drain_timeout_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                anyhow::bail!("supervisor.{} must be a non-negative number, got {}", field, secs);
            }
        }
        Ok(())
    }
}
