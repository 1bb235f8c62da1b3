use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::game::LifecycleState;

/// Failures of the low-level process primitives in [`crate::process`].
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to launch {path}: {message} (code {code:#x})")]
    LaunchFailed {
        path: String,
        code: i32,
        message: String,
    },
    #[error("failed to open process {pid} (code {code:#x})")]
    OpenFailed { pid: u32, code: i32 },
    #[error("failed to suspend process (status {code:#x})")]
    SuspendFailed { code: i32 },
    #[error("failed to resume process (status {code:#x})")]
    ResumeFailed { code: i32 },
    #[error("{what} failed (code {code:#x})")]
    QueryFailed { what: &'static str, code: i32 },
    #[error("process control is only supported on Windows")]
    Unsupported,
}

/// Failures of the control channel to the cooperating module.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("could not connect to {name} within {timeout:?}")]
    ConnectFailed {
        name: String,
        timeout: Duration,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("sending to {name} failed after reconnect: {source}")]
    SendFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while making sure the cooperating module is loaded and reachable.
#[derive(Error, Debug)]
pub enum InjectionError {
    #[error("injection helper not found: {}", .0.display())]
    HelperNotFound(PathBuf),
    #[error("failed to spawn injection helper: {0}")]
    HelperSpawn(#[source] std::io::Error),
    #[error("injection helper exited with {exit_code:?}: {stderr}")]
    HelperFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("bootstrap cancelled")]
    Cancelled,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MonitorError {
    #[error("process monitor has been disposed")]
    Disposed,
}

/// Errors surfaced by [`crate::game::GameProcess`] operations.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("process did not start within {0:?}")]
    LaunchTimeout(Duration),
    #[error("process did not exit within {0:?}")]
    StopTimeout(Duration),
    #[error("game is not running")]
    NotRunning,
    #[error("game is not suspended")]
    NotSuspended,
    #[error("another lifecycle operation is in progress")]
    Busy,
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
    #[error("no injected module to talk to")]
    NoInjection,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Injection(#[from] InjectionError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}
