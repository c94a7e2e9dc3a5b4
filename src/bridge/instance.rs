//! Interpreter instances and the launcher that starts them.
//!
//! An [`Interpreter`] owns one external process. Calls are written to its
//! stdin one at a time; each [`Interpreter::run`] then waits for the first
//! of a result line, an error line, or a shutdown.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{BridgeError, LifecycleError, ScriptError, StreamFault};
use super::events::{Command, Reply};
use super::process::{InterpreterProcess, Pipes, ProcessBuilder};
use super::script::{ScriptLease, SharedScript};
use super::state::{InstanceState, InstanceStateMachine};
use super::stream::{PendingFlag, PendingGuard, ReaderSettings, StreamKind, StreamReader};
use crate::config::BridgeConfig;

/// Default grace period before a forced shutdown kills the process.
pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound of each correlator queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Per-instance tuning.
#[derive(Debug, Clone, Copy)]
pub struct InstanceSettings {
    /// How long `force_shutdown` waits for a cooperative exit.
    pub force_timeout: Duration,
    /// Upper bound on a single `run`, if any.
    pub run_timeout: Option<Duration>,
    /// Stream reader tuning.
    pub reader: ReaderSettings,
    /// Bound of each correlator queue.
    pub queue_capacity: usize,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            force_timeout: DEFAULT_FORCE_TIMEOUT,
            run_timeout: None,
            reader: ReaderSettings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl From<&BridgeConfig> for InstanceSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            force_timeout: config.force_timeout(),
            run_timeout: config.run_timeout(),
            reader: config.reader_settings(),
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

/// Starts interpreter instances that share one companion script.
#[derive(Debug, Clone)]
pub struct Launcher {
    binary: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    script: SharedScript,
    settings: InstanceSettings,
}

impl Launcher {
    /// Create a launcher for `binary` running `script`.
    #[must_use]
    pub fn new(binary: impl Into<String>, script: SharedScript) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            working_dir: None,
            script,
            settings: InstanceSettings::default(),
        }
    }

    /// Launcher for `phantomjs` with the embedded wrapper.
    #[must_use]
    pub fn phantomjs() -> Self {
        Self::new("phantomjs", SharedScript::phantom_wrapper())
    }

    /// Build a launcher from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ScriptError::Read` if a configured script cannot be read.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, ScriptError> {
        let script = match &config.script {
            Some(path) => SharedScript::from_file(path)?,
            None => SharedScript::phantom_wrapper(),
        };
        let mut launcher = Self::new(config.binary.clone(), script)
            .args(config.args.iter().cloned())
            .settings(InstanceSettings::from(config));
        if let Some(dir) = &config.working_dir {
            launcher = launcher.working_dir(dir);
        }
        Ok(launcher)
    }

    /// Append launch flags used by every instance.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory of started processes.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replace the per-instance settings.
    #[must_use]
    pub fn settings(mut self, settings: InstanceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the forced shutdown grace period.
    #[must_use]
    pub fn force_timeout(mut self, timeout: Duration) -> Self {
        self.settings.force_timeout = timeout;
        self
    }

    /// Bound every `run` call.
    #[must_use]
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.settings.run_timeout = Some(timeout);
        self
    }

    /// The shared companion script.
    #[must_use]
    pub fn script(&self) -> &SharedScript {
        &self.script
    }

    /// Start a new interpreter.
    ///
    /// `args` are appended to the launcher's own flags; the script path always
    /// comes last. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Script` if the companion script cannot be
    /// written and `BridgeError::Spawn` if the process cannot be started. The
    /// script's live count is unchanged on failure.
    pub fn start<I, S>(&self, args: I) -> Result<Interpreter, BridgeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lease = self.script.acquire()?;

        let mut builder = ProcessBuilder::new(self.binary.clone())
            .args(self.args.iter().cloned())
            .args(args)
            .script(lease.path());
        if let Some(dir) = &self.working_dir {
            builder = builder.working_dir(dir);
        }

        let mut process = builder.spawn()?;
        let pipes = process.take_pipes()?;
        let interpreter = Interpreter::attach(process, pipes, lease, self.settings);

        tracing::info!(
            instance = %interpreter.id,
            pid = ?interpreter.pid,
            binary = %self.binary,
            "Started interpreter"
        );
        Ok(interpreter)
    }
}

impl Default for Launcher {
    fn default() -> Self {
        Self::phantomjs()
    }
}

/// How a teardown waits for the process.
#[derive(Debug, Clone, Copy)]
enum Shutdown {
    Graceful,
    Forced(Duration),
}

enum WaitOutcome {
    Exited(std::io::Result<ExitStatus>),
    Kill,
}

struct ReplyQueues {
    stdout: mpsc::Receiver<Reply>,
    stderr: mpsc::Receiver<Reply>,
}

impl ReplyQueues {
    /// Discard replies left over from an earlier call.
    ///
    /// A leftover result or error answers a call that stopped waiting, so it
    /// also pays off one owed reply.
    fn drain(&mut self, instance: Uuid, pending: &PendingFlag) {
        while let Ok(reply) = self.stdout.try_recv() {
            Self::discard(instance, "stdout", &reply, pending);
        }
        while let Ok(reply) = self.stderr.try_recv() {
            Self::discard(instance, "stderr", &reply, pending);
        }
    }

    fn discard(instance: Uuid, stream: &'static str, reply: &Reply, pending: &PendingFlag) {
        if !matches!(reply, Reply::Closed(_)) {
            pending.settle_owed();
        }
        tracing::debug!(%instance, stream, ?reply, "Discarding stale reply");
    }

    /// Wait for the first reply, or `None` once the instance is shut down or dead.
    async fn next(
        &mut self,
        shutdown: &CancellationToken,
        dead: &CancellationToken,
    ) -> Option<Reply> {
        // A closed stderr only means no error can arrive; results still can.
        let mut stderr_open = true;
        loop {
            tokio::select! {
                biased;

                reply = self.stdout.recv() => return reply,
                reply = self.stderr.recv(), if stderr_open => match reply {
                    Some(reply) => return Some(reply),
                    None => stderr_open = false,
                },
                () = shutdown.cancelled() => return None,
                () = dead.cancelled() => return None,
            }
        }
    }
}

/// Turn a correlated reply into the call's outcome.
fn settle(
    instance: Uuid,
    reply: Option<Reply>,
    pending: &mut PendingGuard<'_>,
) -> Result<String, BridgeError> {
    match reply {
        Some(Reply::Result(payload)) => {
            pending.answered();
            Ok(payload)
        }
        Some(Reply::Error(message)) => {
            pending.answered();
            tracing::debug!(%instance, %message, "Run failed in interpreter");
            Err(BridgeError::Runtime(message))
        }
        Some(Reply::Closed(err)) if err.fault == StreamFault::EndOfStream => {
            Err(BridgeError::DeadInstance)
        }
        Some(Reply::Closed(err)) => Err(BridgeError::StreamRead(err)),
        None => Err(BridgeError::DeadInstance),
    }
}

struct Lifecycle {
    machine: InstanceStateMachine,
    process: Option<InterpreterProcess>,
    readers: Vec<JoinHandle<()>>,
    lease: Option<ScriptLease>,
    outcome: Option<Result<(), LifecycleError>>,
}

/// A running interpreter process and its line-protocol channel.
///
/// Methods take `&self`, so an instance can be shared behind an `Arc` and
/// shut down from another task while a call is pending. Calls are serialized:
/// at most one `run` or `load` is in flight at a time.
pub struct Interpreter {
    id: Uuid,
    pid: Option<u32>,
    settings: InstanceSettings,
    stdin: Mutex<Option<ChildStdin>>,
    replies: Mutex<ReplyQueues>,
    pending: PendingFlag,
    /// Teardown has started.
    shutdown: CancellationToken,
    /// The process is known to be gone (result stream closed or stdin broken).
    dead: CancellationToken,
    /// Kill an in-progress teardown.
    escalate: CancellationToken,
    /// Teardown has finished.
    finished: CancellationToken,
    stop_readers: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("dead", &self.is_dead())
            .finish_non_exhaustive()
    }
}

impl Interpreter {
    fn attach(
        process: InterpreterProcess,
        pipes: Pipes,
        lease: ScriptLease,
        settings: InstanceSettings,
    ) -> Self {
        let id = Uuid::new_v4();
        let pid = process.id();
        let capacity = settings.queue_capacity.max(1);
        let (stdout_tx, stdout_rx) = mpsc::channel(capacity);
        let (stderr_tx, stderr_rx) = mpsc::channel(capacity);
        let pending = PendingFlag::new();
        let dead = CancellationToken::new();
        let stop_readers = CancellationToken::new();

        let stdout_reader = StreamReader::new(
            StreamKind::Stdout,
            id,
            pipes.stdout,
            settings.reader,
            stdout_tx,
            pending.clone(),
            stop_readers.clone(),
        )
        .signal_close(dead.clone())
        .spawn();
        let stderr_reader = StreamReader::new(
            StreamKind::Stderr,
            id,
            pipes.stderr,
            settings.reader,
            stderr_tx,
            pending.clone(),
            stop_readers.clone(),
        )
        .spawn();

        Self {
            id,
            pid,
            settings,
            stdin: Mutex::new(Some(pipes.stdin)),
            replies: Mutex::new(ReplyQueues {
                stdout: stdout_rx,
                stderr: stderr_rx,
            }),
            pending,
            shutdown: CancellationToken::new(),
            dead,
            escalate: CancellationToken::new(),
            finished: CancellationToken::new(),
            stop_readers,
            lifecycle: Mutex::new(Lifecycle {
                machine: InstanceStateMachine::new(),
                process: Some(process),
                readers: vec![stdout_reader, stderr_reader],
                lease: Some(lease),
                outcome: None,
            }),
        }
    }

    /// Unique identifier of this instance, used in logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// OS process id at start.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns true once the instance was shut down or its process died.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.shutdown.is_cancelled() || self.dead.is_cancelled()
    }

    /// Current lifecycle state.
    ///
    /// A process that died on its own reports `Dead` even before `exit` or
    /// `force_shutdown` reaps it.
    pub async fn state(&self) -> InstanceState {
        let state = self.lifecycle.lock().await.machine.state();
        if state == InstanceState::Live && self.dead.is_cancelled() {
            return InstanceState::Dead;
        }
        state
    }

    fn ensure_alive(&self) -> Result<(), BridgeError> {
        if self.is_dead() {
            return Err(BridgeError::DeadInstance);
        }
        Ok(())
    }

    /// Evaluate `code` in the interpreter's global context.
    ///
    /// No reply is awaited; anything the code prints shows up as log output.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::DeadInstance` after shutdown,
    /// `BridgeError::InvalidCommand` for unframeable code and
    /// `BridgeError::Send` if stdin is broken.
    pub async fn load(&self, code: &str) -> Result<(), BridgeError> {
        self.ensure_alive()?;
        let envelope = Command::Eval(code).encode()?;
        let _call = self.replies.lock().await;
        self.ensure_alive()?;
        self.send("EVAL", &envelope).await
    }

    /// Run a function and decode its result.
    ///
    /// Waits for exactly one of: a `RES` line (decoded into `T`), an stderr
    /// line (returned as `BridgeError::Runtime`), or a shutdown.
    ///
    /// # Errors
    ///
    /// - `BridgeError::DeadInstance` if the instance is or becomes dead.
    /// - `BridgeError::Runtime` if the hosted code threw.
    /// - `BridgeError::Protocol` if the payload does not decode as `T`.
    /// - `BridgeError::Send` if the command could not be written.
    /// - `BridgeError::Timeout` if a run timeout is configured and elapses.
    pub async fn run<T: DeserializeOwned>(&self, code: &str) -> Result<T, BridgeError> {
        self.ensure_alive()?;
        let envelope = Command::Run(code).encode()?;

        let mut queues = self.replies.lock().await;
        self.ensure_alive()?;
        queues.drain(self.id, &self.pending);

        // Dropping the guard unanswered, on timeout or when the caller gives
        // up, leaves the reply owed so it cannot complete a later call.
        let mut pending = self.pending.raise();
        self.send("RUN", &envelope).await?;

        let reply = match self.settings.run_timeout {
            Some(limit) => tokio::time::timeout(limit, queues.next(&self.shutdown, &self.dead))
                .await
                .map_err(|_| {
                    tracing::warn!(instance = %self.id, timeout = ?limit, "Run timed out");
                    BridgeError::Timeout(limit)
                })?,
            None => queues.next(&self.shutdown, &self.dead).await,
        };
        let payload = settle(self.id, reply, &mut pending)?;

        serde_json::from_str(&payload).map_err(|source| BridgeError::Protocol { payload, source })
    }

    async fn send(&self, verb: &str, envelope: &str) -> Result<(), BridgeError> {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(BridgeError::DeadInstance);
        };

        let written = match pipe.write_all(envelope.as_bytes()).await {
            Ok(()) => pipe.flush().await,
            Err(e) => Err(e),
        };

        if let Err(source) = written {
            tracing::warn!(instance = %self.id, verb, error = %source, "Failed to write command");
            stdin.take();
            self.dead.cancel();
            return Err(BridgeError::Send {
                command: verb.to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Ask the interpreter to exit and wait for it.
    ///
    /// Only the first call does the work; later calls return its outcome.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Lifecycle` if waiting fails or the process
    /// exits with a failure status.
    pub async fn exit(&self) -> Result<(), BridgeError> {
        self.teardown(Shutdown::Graceful)
            .await
            .map_err(BridgeError::from)
    }

    /// Ask the interpreter to exit, killing it if it has not done so within
    /// the force timeout.
    ///
    /// If an `exit` is already waiting on a hung process, that teardown is
    /// escalated to a kill once the timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Lifecycle` if waiting or killing fails.
    pub async fn force_shutdown(&self) -> Result<(), BridgeError> {
        self.teardown(Shutdown::Forced(self.settings.force_timeout))
            .await
            .map_err(BridgeError::from)
    }

    async fn teardown(&self, mode: Shutdown) -> Result<(), LifecycleError> {
        let process = {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.machine.transition(InstanceState::Exiting) {
                self.shutdown.cancel();
                lifecycle.process.take()
            } else {
                None
            }
        };

        let Some(mut process) = process else {
            return self.join_teardown(mode).await;
        };

        tracing::debug!(instance = %self.id, ?mode, "Shutting down interpreter");
        let result = self.reap(&mut process, mode).await;

        self.stop_readers.cancel();
        self.stdin.lock().await.take();

        let readers = std::mem::take(&mut self.lifecycle.lock().await.readers);
        for reader in readers {
            if let Err(e) = reader.await {
                tracing::warn!(instance = %self.id, error = %e, "Reader task failed");
            }
        }

        {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.lease.take();
            lifecycle.machine.transition(InstanceState::Dead);
            lifecycle.outcome = Some(result.clone());
        }
        self.finished.cancel();

        match &result {
            Ok(()) => tracing::info!(instance = %self.id, "Interpreter stopped"),
            Err(e) => tracing::warn!(instance = %self.id, error = %e, "Interpreter stopped uncleanly"),
        }
        result
    }

    /// Wait for a teardown started by another call.
    async fn join_teardown(&self, mode: Shutdown) -> Result<(), LifecycleError> {
        if let Shutdown::Forced(limit) = mode {
            if tokio::time::timeout(limit, self.finished.cancelled())
                .await
                .is_err()
            {
                tracing::warn!(instance = %self.id, "Teardown still pending, killing interpreter");
                self.escalate.cancel();
            }
        }
        self.finished.cancelled().await;
        self.lifecycle
            .lock()
            .await
            .outcome
            .clone()
            .unwrap_or(Ok(()))
    }

    async fn reap(
        &self,
        process: &mut InterpreterProcess,
        mode: Shutdown,
    ) -> Result<(), LifecycleError> {
        let outcome = {
            let graceful = async {
                if let Err(e) = self.send_exit().await {
                    tracing::debug!(instance = %self.id, error = %e, "Exit command not delivered");
                }
                process.wait().await
            };

            match mode {
                Shutdown::Graceful => tokio::select! {
                    biased;

                    () = self.escalate.cancelled() => WaitOutcome::Kill,
                    status = graceful => WaitOutcome::Exited(status),
                },
                Shutdown::Forced(limit) => tokio::select! {
                    biased;

                    () = self.escalate.cancelled() => WaitOutcome::Kill,
                    status = graceful => WaitOutcome::Exited(status),
                    () = tokio::time::sleep(limit) => {
                        tracing::warn!(instance = %self.id, timeout = ?limit, "Interpreter did not exit in time, killing");
                        WaitOutcome::Kill
                    }
                },
            }
        };

        match (outcome, mode) {
            (WaitOutcome::Exited(Err(e)), _) => Err(LifecycleError::Wait(Arc::new(e))),
            (WaitOutcome::Exited(Ok(status)), Shutdown::Graceful) if !status.success() => {
                Err(LifecycleError::AbnormalExit(status))
            }
            (WaitOutcome::Exited(Ok(_)), _) => Ok(()),
            (WaitOutcome::Kill, _) => match process.kill().await {
                Ok(_) => Ok(()),
                Err(e) => Err(LifecycleError::Kill(Arc::new(e))),
            },
        }
    }

    async fn send_exit(&self) -> Result<(), BridgeError> {
        let envelope = Command::exit().encode()?;
        self.send("EVAL", &envelope).await
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.stop_readers.cancel();
    }
}
