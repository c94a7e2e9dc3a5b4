//! Interpreter process spawning and control.
//!
//! This module provides a builder for the interpreter's launch arguments and
//! a thin wrapper over the spawned child that owns its three pipes.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary was not found.
    #[error("Interpreter binary not found: {0}")]
    NotFound(String),
    /// Permission denied when spawning.
    #[error("Permission denied")]
    PermissionDenied,
    /// A stdio pipe was not connected.
    #[error("Process {0} not available")]
    MissingPipe(&'static str),
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(binary: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(binary.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// Builder for the interpreter command line.
///
/// Launch flags are passed through unmodified; the companion script path is
/// always appended last.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    binary: String,
    args: Vec<String>,
    script: Option<PathBuf>,
    working_dir: Option<PathBuf>,
}

impl ProcessBuilder {
    /// Create a builder for the given binary.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            script: None,
            working_dir: None,
        }
    }

    /// Append launch flags.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the companion script passed as the final argument.
    #[must_use]
    pub fn script(mut self, path: impl Into<PathBuf>) -> Self {
        self.script = Some(path.into());
        self
    }

    /// Set the working directory for the interpreter process.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Build the command-line arguments.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(script) = &self.script {
            args.push(script.to_string_lossy().into_owned());
        }
        args
    }

    /// Spawn the interpreter with all three stdio streams piped.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(&self) -> Result<InterpreterProcess, SpawnError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.build_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(&self.binary, e))?;

        tracing::debug!(binary = %self.binary, pid = ?child.id(), "Spawned interpreter");
        Ok(InterpreterProcess { child })
    }
}

/// A running interpreter process.
#[derive(Debug)]
pub struct InterpreterProcess {
    child: Child,
}

/// The three pipes of a freshly spawned interpreter.
#[derive(Debug)]
pub struct Pipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl InterpreterProcess {
    /// Take ownership of all three pipes.
    ///
    /// This can only succeed once.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError::MissingPipe` if a pipe was already taken.
    pub fn take_pipes(&mut self) -> Result<Pipes, SpawnError> {
        let stdin = self.child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = self
            .child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;
        Ok(Pipes {
            stdin,
            stdout,
            stderr,
        })
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Forcefully kill the process and reap it.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be sent.
    pub async fn kill(&mut self) -> std::io::Result<ExitStatus> {
        match self.child.start_kill() {
            Ok(()) => {}
            // Already reaped or exited between checks.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait().await
    }
}
