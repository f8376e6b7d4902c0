use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle phase of a single process monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    RestartPending,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::RestartPending => "restart_pending",
        }
    }

    /// A child process exists (or is about to) in this phase.
    pub fn has_child(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Running | Phase::Stopping)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0} -> {1}")]
    InvalidTransition(Phase, Phase),
}

#[derive(Debug)]
pub struct StateMachine {
    phase: Phase,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn can_transition(&self, to: Phase) -> bool {
        matches!(
            (self.phase, to),
            (Phase::Idle, Phase::Starting)
                | (Phase::RestartPending, Phase::Starting)
                | (Phase::Starting, Phase::Running)
                | (Phase::Starting, Phase::Idle)
                | (Phase::Starting, Phase::Stopping)
                | (Phase::Running, Phase::Stopping)
                | (Phase::Running, Phase::RestartPending)
                | (Phase::Running, Phase::Idle)
                | (Phase::Stopping, Phase::Idle)
                | (Phase::RestartPending, Phase::Idle)
        )
    }

    /// Move to `to`, logging the transition. `label` names the owner in the log.
    pub fn transition(&mut self, label: &str, to: Phase) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::info!("[{}] {} -> {}", label, self.phase, to);
            self.phase = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.phase, to))
        }
    }
}
