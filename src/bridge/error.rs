//! Error types for the interpreter bridge.

use std::process::ExitStatus;
use std::sync::Arc;

use super::process::SpawnError;

/// Why a stream reader stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// The stream kept reporting end-of-file past the retry budget.
    EndOfStream,
    /// The underlying descriptor was already closed; the process is gone.
    ClosedDescriptor,
    /// Any other I/O failure.
    Other,
}

/// A terminal read failure on one of the interpreter's output streams.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{stream} read failed ({fault:?}): {message}")]
pub struct StreamReadError {
    /// Stream name (`stdout` or `stderr`).
    pub stream: &'static str,
    /// Structural classification of the failure.
    pub fault: StreamFault,
    /// Human readable detail.
    pub message: String,
}

impl StreamReadError {
    /// Reader gave up after too many consecutive empty reads.
    #[must_use]
    pub fn end_of_stream(stream: &'static str, reads: u32) -> Self {
        Self {
            stream,
            fault: StreamFault::EndOfStream,
            message: format!("{reads} consecutive empty reads"),
        }
    }

    /// Classify an I/O error raised by a read.
    #[must_use]
    pub fn from_io(stream: &'static str, err: &std::io::Error) -> Self {
        let fault = if is_closed_descriptor(err) {
            StreamFault::ClosedDescriptor
        } else {
            StreamFault::Other
        };
        Self {
            stream,
            fault,
            message: err.to_string(),
        }
    }
}

#[cfg(unix)]
fn is_closed_descriptor(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EBADF as i32)
}

#[cfg(not(unix))]
fn is_closed_descriptor(_err: &std::io::Error) -> bool {
    false
}

/// Failure while waiting for or killing the interpreter process.
///
/// Cloneable so that repeated `exit`/`force_shutdown` calls can return the
/// outcome of the first teardown.
#[derive(thiserror::Error, Debug, Clone)]
pub enum LifecycleError {
    /// Waiting on the child failed.
    #[error("Failed to wait for interpreter: {0}")]
    Wait(Arc<std::io::Error>),
    /// Sending the kill signal failed.
    #[error("Failed to kill interpreter: {0}")]
    Kill(Arc<std::io::Error>),
    /// The interpreter exited on its own with a failure status.
    #[error("Interpreter exited abnormally: {0}")]
    AbnormalExit(ExitStatus),
}

/// Failure to materialise the shared companion script.
#[derive(thiserror::Error, Debug)]
pub enum ScriptError {
    /// The companion script could not be read from disk.
    #[error("Failed to read companion script {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// The temporary script file could not be created or written.
    #[error("Failed to write companion script: {0}")]
    Write(#[from] std::io::Error),
}

/// Errors returned by the public interpreter operations.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// The process could not be started.
    #[error("Failed to start interpreter: {0}")]
    Spawn(#[from] SpawnError),
    /// The shared script could not be created.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// Writing a command to stdin failed; the instance is now dead.
    #[error("Cannot send `{command}`: interpreter might be dead ({source})")]
    Send {
        command: String,
        source: std::io::Error,
    },
    /// The code would break command framing.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    /// The result stream failed while a call was pending.
    #[error(transparent)]
    StreamRead(#[from] StreamReadError),
    /// A result payload was not valid for the requested type.
    #[error("Failed to decode result `{payload}`: {source}")]
    Protocol {
        payload: String,
        source: serde_json::Error,
    },
    /// The hosted code threw.
    #[error("Interpreter error: {0}")]
    Runtime(String),
    /// The instance was shut down or its process is gone.
    #[error("Interpreter is no longer running")]
    DeadInstance,
    /// No reply arrived within the configured run timeout.
    #[error("No reply within {0:?}")]
    Timeout(std::time::Duration),
    /// Waiting for or killing the process failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl BridgeError {
    /// Returns true if this error means the instance can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::Send { .. } | Self::StreamRead(_) | Self::DeadInstance
        )
    }
}
