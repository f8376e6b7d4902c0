use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const STORE_FILE: &str = "profiles.json";

/// One environment variable, kept in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// A supervised script and its runtime policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub script_path: PathBuf,
    /// Defaults to the script's parent directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Combined stdout/stderr target. Filled with a per-profile file when empty.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_restart_wait")]
    pub restart_wait_secs: f64,
    #[serde(default)]
    pub startup_delay_secs: f64,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    #[serde(default)]
    pub auto_start: bool,
    /// Run the script through this program (e.g. `/bin/bash`) instead of executing it directly
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default = "default_true")]
    pub restart_on_exit: bool,
    /// Disabled profiles are kept but never started
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_restart_wait() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

impl Profile {
    pub fn new(name: &str, script_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            script_path: script_path.into(),
            working_dir: None,
            log_path: None,
            restart_wait_secs: default_restart_wait(),
            startup_delay_secs: 0.0,
            environment: Vec::new(),
            auto_start: false,
            interpreter: None,
            restart_on_exit: true,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("profile name must not be empty".into());
        }
        if self.script_path.as_os_str().is_empty() {
            return Err(format!("profile '{}' has no script path", self.name));
        }
        for (field, secs) in [
            ("restart_wait_secs", self.restart_wait_secs),
            ("startup_delay_secs", self.startup_delay_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(format!(
                    "profile '{}': {} must be a non-negative number, got {}",
                    self.name, field, secs
                ));
            }
        }
        if self.environment.iter().any(|v| v.key.is_empty() || v.key.contains('=')) {
            return Err(format!("profile '{}' has an invalid environment key", self.name));
        }
        Ok(())
    }

    pub fn restart_wait(&self) -> Duration {
        Duration::from_secs_f64(self.restart_wait_secs.max(0.0))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs_f64(self.startup_delay_secs.max(0.0))
    }

    pub fn effective_working_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) => dir.clone(),
            None => self
                .script_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Log target, falling back to `<log_dir>/<name>.log`.
    pub fn effective_log_path(&self, log_dir: &Path) -> PathBuf {
        match &self.log_path {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => log_dir.join(format!("{}.log", file_safe_name(&self.name))),
        }
    }

    /// Fill an empty `log_path` so the generated location is persisted with the profile.
    pub fn with_default_log_path(mut self, log_dir: &Path) -> Self {
        self.log_path = Some(self.effective_log_path(log_dir));
        self
    }
}

fn file_safe_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("profile store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile store {path} is corrupt (backed up to {backup}): {source}")]
    Corrupt {
        path: PathBuf,
        backup: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize profiles: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to replace profile store: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Profile store - manages `profiles.json` under the data directory.
pub struct ProfileStore {
    base_dir: PathBuf,
    file_path: PathBuf,
}

impl ProfileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let file_path = base_dir.join(STORE_FILE);
        Self { base_dir, file_path }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn store_path(&self) -> &Path {
        &self.file_path
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Load all profiles in stored order.
    pub fn load(&self) -> Result<Vec<Profile>, StoreError> {
        if !self.file_path.exists() {
            tracing::info!("Profile store {} does not exist yet", self.file_path.display());
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.file_path)?;
        match serde_json::from_str::<Vec<Profile>>(&content) {
            Ok(profiles) => {
                tracing::info!("Loaded {} profiles", profiles.len());
                Ok(profiles)
            }
            Err(source) => {
                let backup = self.file_path.with_extension("bak");
                fs::copy(&self.file_path, &backup)?;
                tracing::error!(
                    "Profile store is corrupt, copied to {}: {}",
                    backup.display(),
                    source
                );
                Err(StoreError::Corrupt {
                    path: self.file_path.clone(),
                    backup,
                    source,
                })
            }
        }
    }

    /// Atomically replace the store with `profiles`.
    pub fn save(&self, profiles: &[Profile]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.base_dir)?;
        let content = serde_json::to_string_pretty(profiles)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.base_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.file_path)?;

        tracing::info!("Saved {} profiles", profiles.len());
        Ok(())
    }
}
