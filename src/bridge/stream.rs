//! Background readers for the interpreter's output streams.
//!
//! One reader task runs per stream. It classifies every line and forwards
//! results and errors to a bounded correlator queue. Delivery never blocks:
//! output that no pending call is waiting for is logged and dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{StreamFault, StreamReadError};
use super::events::{classify_stderr, classify_stdout, ClassifiedLine, Reply};

/// Which output stream a reader is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Stream name used in logs and errors.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Classify a raw line read from this stream.
    #[must_use]
    pub fn classify(self, line: &str) -> Option<ClassifiedLine> {
        match self {
            Self::Stdout => classify_stdout(line),
            Self::Stderr => classify_stderr(line),
        }
    }
}

/// Tuning for a stream reader.
#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    /// Capacity of the read buffer in bytes.
    pub buffer_capacity: usize,
    /// Consecutive end-of-file reads tolerated before the stream counts as closed.
    pub max_empty_reads: u32,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 2048 * 1024,
            max_empty_reads: 100,
        }
    }
}

#[derive(Debug, Default)]
struct PendingState {
    raised: AtomicBool,
    owed: AtomicUsize,
}

/// Flag raised by the correlator while a call is waiting for its reply.
///
/// It also counts replies owed to calls that stopped waiting (timed out or
/// cancelled). The process still answers those calls, and each such answer
/// must be discarded rather than handed to a later call.
#[derive(Debug, Clone, Default)]
pub struct PendingFlag(Arc<PendingState>);

impl PendingFlag {
    /// Create a lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a call as waiting. The flag drops again when the guard does.
    #[must_use]
    pub fn raise(&self) -> PendingGuard<'_> {
        self.0.raised.store(true, Ordering::SeqCst);
        PendingGuard {
            flag: self,
            answered: false,
        }
    }

    /// Returns true while a call is waiting.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::SeqCst)
    }

    /// Replies still owed to abandoned calls.
    #[must_use]
    pub fn owed(&self) -> usize {
        self.0.owed.load(Ordering::SeqCst)
    }

    /// Account one reply against an abandoned call. Returns false if none is
    /// owed.
    pub fn settle_owed(&self) -> bool {
        self.0
            .owed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Lowers the pending flag on drop.
///
/// A guard dropped before [`PendingGuard::answered`] was called leaves one
/// reply owed, so the late answer is not mistaken for the next call's.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    flag: &'a PendingFlag,
    answered: bool,
}

impl PendingGuard<'_> {
    /// Record that the call received its reply.
    pub fn answered(&mut self) {
        self.answered = true;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let state = &self.flag.0;
        // Count the debt before lowering, so a reader that sees the flag
        // down also sees the debt.
        if !self.answered {
            state.owed.fetch_add(1, Ordering::SeqCst);
        }
        state.raised.store(false, Ordering::SeqCst);
    }
}

/// Reads one output stream until it closes or is told to stop.
pub struct StreamReader<R> {
    kind: StreamKind,
    instance: Uuid,
    reader: BufReader<R>,
    queue: mpsc::Sender<Reply>,
    pending: PendingFlag,
    stop: CancellationToken,
    closed: Option<CancellationToken>,
    max_empty_reads: u32,
}

impl<R> StreamReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Create a reader over `source` that delivers into `queue`.
    pub fn new(
        kind: StreamKind,
        instance: Uuid,
        source: R,
        settings: ReaderSettings,
        queue: mpsc::Sender<Reply>,
        pending: PendingFlag,
        stop: CancellationToken,
    ) -> Self {
        Self {
            kind,
            instance,
            reader: BufReader::with_capacity(settings.buffer_capacity.max(1), source),
            queue,
            pending,
            stop,
            closed: None,
            max_empty_reads: settings.max_empty_reads.max(1),
        }
    }

    /// Cancel `token` when this stream closes for good, and report the
    /// closure to a pending call.
    ///
    /// Only the stream that carries results should do this: once it is gone
    /// no call can ever complete.
    #[must_use]
    pub fn signal_close(mut self, token: CancellationToken) -> Self {
        self.closed = Some(token);
        self
    }

    /// Run the reader on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Read and dispatch lines until the stream ends or a stop is requested.
    pub async fn run(mut self) {
        let stream = self.kind.name();
        let mut buf = Vec::new();
        let mut empty_reads: u32 = 0;

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;

                () = self.stop.cancelled() => {
                    tracing::debug!(instance = %self.instance, stream, "Reader stopped");
                    return;
                }
                read = self.reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    empty_reads += 1;
                    if empty_reads >= self.max_empty_reads {
                        self.finish(StreamReadError::end_of_stream(stream, empty_reads));
                        return;
                    }
                    tokio::task::yield_now().await;
                }
                Ok(_) => {
                    empty_reads = 0;
                    let line = String::from_utf8_lossy(&buf);
                    self.dispatch(&line);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.finish(StreamReadError::from_io(stream, &e));
                    return;
                }
            }
        }
    }

    fn dispatch(&self, line: &str) {
        match self.kind.classify(line) {
            None => {}
            Some(ClassifiedLine::Log(text)) => {
                tracing::info!(instance = %self.instance, stream = self.kind.name(), "{text}");
            }
            Some(ClassifiedLine::Result(payload)) => self.deliver(Reply::Result(payload)),
            Some(ClassifiedLine::Error(message)) => self.deliver(Reply::Error(message)),
        }
    }

    fn deliver(&self, reply: Reply) {
        let stream = self.kind.name();
        let raised = self.pending.is_raised();
        if !matches!(reply, Reply::Closed(_)) && self.pending.settle_owed() {
            tracing::debug!(instance = %self.instance, stream, ?reply, "Discarding reply to an abandoned call");
            return;
        }
        if !raised {
            tracing::warn!(instance = %self.instance, stream, ?reply, "Discarding unclaimed output");
            return;
        }
        match self.queue.try_send(reply) {
            Ok(()) => {}
            Err(TrySendError::Full(reply)) => {
                tracing::warn!(instance = %self.instance, stream, ?reply, "Discarding unclaimed output");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(instance = %self.instance, stream, "Correlator queue closed");
            }
        }
    }

    fn finish(&self, err: StreamReadError) {
        let stream = self.kind.name();
        if err.fault == StreamFault::EndOfStream {
            tracing::debug!(instance = %self.instance, stream, "Stream closed");
        } else {
            tracing::warn!(instance = %self.instance, stream, error = %err, "Stream read failed");
        }

        if let Some(closed) = &self.closed {
            self.deliver(Reply::Closed(err));
            closed.cancel();
        }
    }
}
