//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::ReaderSettings;

/// Configuration for launching and talking to interpreter instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Interpreter executable.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Launch flags passed through unmodified.
    #[serde(default)]
    pub args: Vec<String>,
    /// Companion script to use instead of the embedded wrapper.
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Working directory of started processes; inherited when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Grace period before a forced shutdown kills the process.
    #[serde(default = "default_force_timeout_ms")]
    pub force_timeout_ms: u64,
    /// Upper bound on a single run; unbounded when unset.
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    /// Stream reader buffer size in KiB.
    #[serde(default = "default_read_buffer_kb")]
    pub read_buffer_kb: usize,
    /// Consecutive empty reads tolerated before a stream counts as closed.
    #[serde(default = "default_max_empty_reads")]
    pub max_empty_reads: u32,
    /// Bound of each reply queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_binary() -> String {
    "phantomjs".to_string()
}

fn default_force_timeout_ms() -> u64 {
    3000
}

fn default_read_buffer_kb() -> usize {
    2048
}

fn default_max_empty_reads() -> u32 {
    100
}

fn default_queue_capacity() -> usize {
    1
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: Vec::new(),
            script: None,
            working_dir: None,
            force_timeout_ms: default_force_timeout_ms(),
            run_timeout_ms: None,
            read_buffer_kb: default_read_buffer_kb(),
            max_empty_reads: default_max_empty_reads(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BridgeConfig {
    /// Forced shutdown grace period.
    #[must_use]
    pub fn force_timeout(&self) -> Duration {
        Duration::from_millis(self.force_timeout_ms)
    }

    /// Per-run timeout, if configured.
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// Reader tuning. Zero values fall back to the defaults.
    #[must_use]
    pub fn reader_settings(&self) -> ReaderSettings {
        let buffer_kb = if self.read_buffer_kb == 0 {
            default_read_buffer_kb()
        } else {
            self.read_buffer_kb
        };
        let max_empty_reads = if self.max_empty_reads == 0 {
            default_max_empty_reads()
        } else {
            self.max_empty_reads
        };
        ReaderSettings {
            buffer_capacity: buffer_kb.saturating_mul(1024),
            max_empty_reads,
        }
    }
}
