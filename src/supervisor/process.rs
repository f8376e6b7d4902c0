use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, when killed by one (unix only)
    pub signal: Option<i32>,
    /// Unix timestamp (seconds) at which the exit was observed
    pub at: u64,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            at: current_timestamp(),
        }
    }

    /// Exit whose status could not be collected.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            at: current_timestamp(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Ask a child (and its process group) to exit.
pub fn terminate(pid: u32) -> Result<(), ProcessError> {
    check_pid(pid)?;
    tracing::debug!("Sending TERM to process group {}", pid);
    send_signal(pid, false)
}

/// Kill a child (and its process group) without giving it a chance to clean up.
pub fn force_kill(pid: u32) -> Result<(), ProcessError> {
    check_pid(pid)?;
    tracing::debug!("Sending KILL to process group {}", pid);
    send_signal(pid, true)
}

/// Pid 0 (and anything that wraps negative) would address our own process group.
fn check_pid(pid: u32) -> Result<(), ProcessError> {
    if pid == 0 || i32::try_from(pid).is_err() {
        return Err(ProcessError::SignalFailed {
            pid,
            reason: "not a valid child pid".into(),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let target = Pid::from_raw(pid as i32);

    // Children are spawned as process group leaders, so the group id equals the pid.
    match signal::killpg(target, signal) {
        Ok(()) => return Ok(()),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
        Err(e) => {
            tracing::debug!("killpg({}) failed: {}, falling back to kill", pid, e);
        }
    }

    match signal::kill(target, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::SignalFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, force: bool) -> Result<(), ProcessError> {
    let pid_arg = pid.to_string();
    let mut args = vec!["/T", "/PID", pid_arg.as_str()];
    if force {
        args.insert(0, "/F");
    }
    std::process::Command::new("taskkill")
        .args(&args)
        .output()
        .map(|_| ())
        .map_err(|e| ProcessError::SignalFailed {
            pid,
            reason: e.to_string(),
        })
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
