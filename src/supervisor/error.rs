//! Supervisor error types. Each variant maps to an HTTP status code and a
//! machine-readable code so IPC handlers can return them directly.

use axum::http::StatusCode;
use std::path::PathBuf;

use super::state_machine::{Phase, TransitionError};
use crate::profile::StoreError;

/// Why a script could not be launched.
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("script not found: {0}")]
    ScriptNotFound(PathBuf),

    #[error("script is not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(PathBuf),

    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by a single process monitor.
#[derive(thiserror::Error, Debug)]
pub enum MonitorError {
    #[error("failed to launch '{name}': {source}")]
    Launch {
        name: String,
        #[source]
        source: LaunchError,
    },

    #[error("'{name}' is already {phase}")]
    AlreadyActive { name: String, phase: Phase },

    #[error("'{0}' has been removed")]
    Retired(String),

    #[error("failed to terminate '{name}' (pid {pid}): {reason}")]
    TerminationFailed { name: String, pid: u32, reason: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Errors surfaced by the supervisor to the presentation layer.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Profile '{0}' not found")]
    ProfileNotFound(String),

    #[error("Profile '{0}' already exists")]
    ProfileExists(String),

    #[error("Profile '{name}' is {phase}; stop it first")]
    ProfileInUse { name: String, phase: Phase },

    #[error("Profile '{0}' is disabled")]
    ProfileDisabled(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ProfileNotFound(_) => StatusCode::NOT_FOUND,
            Self::ProfileExists(_) | Self::ProfileInUse { .. } | Self::ProfileDisabled(_) => {
                StatusCode::CONFLICT
            }
            Self::InvalidProfile(_) => StatusCode::BAD_REQUEST,
            Self::Monitor(MonitorError::Launch { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Monitor(MonitorError::AlreadyActive { .. }) => StatusCode::CONFLICT,
            Self::Monitor(MonitorError::Retired(_)) => StatusCode::GONE,
            Self::Monitor(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            Self::ProfileExists(_) => "PROFILE_EXISTS",
            Self::ProfileInUse { .. } => "PROFILE_IN_USE",
            Self::ProfileDisabled(_) => "PROFILE_DISABLED",
            Self::InvalidProfile(_) => "INVALID_PROFILE",
            Self::Monitor(MonitorError::Launch { .. }) => "LAUNCH_FAILED",
            Self::Monitor(MonitorError::AlreadyActive { .. }) => "ALREADY_ACTIVE",
            Self::Monitor(MonitorError::Retired(_)) => "PROFILE_REMOVED",
            Self::Monitor(MonitorError::TerminationFailed { .. }) => "TERMINATION_FAILED",
            Self::Monitor(MonitorError::Transition(_)) => "INVALID_TRANSITION",
            Self::Store(_) => "STORE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
