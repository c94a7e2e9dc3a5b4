//! Companion script shared by every interpreter started from one launcher.
//!
//! The script is written to a temporary file when the first instance
//! acquires it and removed when the last lease is released.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tempfile::TempPath;

use super::error::ScriptError;

/// Default companion script for PhantomJS.
pub const PHANTOM_WRAPPER: &str = include_str!("../../assets/wrapper.js");

#[derive(Debug, Default)]
struct ScriptState {
    live: usize,
    file: Option<TempPath>,
}

#[derive(Debug)]
struct ScriptInner {
    contents: Vec<u8>,
    state: Mutex<ScriptState>,
}

impl ScriptInner {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reference-counted on-disk companion script.
///
/// Cloning is cheap and shares the same counter and file.
#[derive(Debug, Clone)]
pub struct SharedScript {
    inner: Arc<ScriptInner>,
}

impl SharedScript {
    /// Create a shared script with the given contents.
    #[must_use]
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(ScriptInner {
                contents: contents.into(),
                state: Mutex::new(ScriptState::default()),
            }),
        }
    }

    /// The embedded PhantomJS wrapper.
    #[must_use]
    pub fn phantom_wrapper() -> Self {
        Self::new(PHANTOM_WRAPPER)
    }

    /// Load script contents from a file.
    ///
    /// # Errors
    ///
    /// Returns `ScriptError::Read` if the file cannot be read.
    pub fn from_file(path: &Path) -> Result<Self, ScriptError> {
        let contents = std::fs::read(path).map_err(|source| ScriptError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(contents))
    }

    /// Take a lease on the script file, creating it if this is the first.
    ///
    /// # Errors
    ///
    /// Returns `ScriptError::Write` if the file cannot be created. The live
    /// count is left unchanged in that case.
    pub fn acquire(&self) -> Result<ScriptLease, ScriptError> {
        let mut state = self.inner.lock();
        let file = match state.file.take() {
            Some(file) => file,
            None => {
                let file = self.materialise()?;
                tracing::debug!(path = %file.display(), "Created companion script");
                file
            }
        };
        let path = file.to_path_buf();
        state.file = Some(file);
        state.live += 1;
        Ok(ScriptLease {
            inner: Arc::clone(&self.inner),
            path,
        })
    }

    fn materialise(&self) -> Result<TempPath, ScriptError> {
        let mut file = tempfile::Builder::new()
            .prefix("phantom-wrapper-")
            .suffix(".js")
            .tempfile()?;
        file.write_all(&self.inner.contents)?;
        file.flush()?;
        Ok(file.into_temp_path())
    }

    /// Number of outstanding leases.
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.inner.lock().live
    }

    /// Path of the script file, if it currently exists.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().file.as_ref().map(|f| f.to_path_buf())
    }
}

impl Default for SharedScript {
    fn default() -> Self {
        Self::phantom_wrapper()
    }
}

/// One instance's hold on the shared script. Dropping it releases the hold.
#[derive(Debug)]
pub struct ScriptLease {
    inner: Arc<ScriptInner>,
    path: PathBuf,
}

impl ScriptLease {
    /// Path of the script file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScriptLease {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.live = state.live.saturating_sub(1);
        if state.live > 0 {
            return;
        }
        if let Some(file) = state.file.take() {
            let path = file.to_path_buf();
            match file.close() {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed companion script"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove companion script");
                }
            }
        }
    }
}
