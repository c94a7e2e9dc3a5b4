//! Configuration file loader.

use std::path::PathBuf;

use super::BridgeConfig;

/// Environment variable overriding the configured interpreter binary.
pub const BINARY_ENV: &str = "PHANTOM_HOST_BINARY";

/// Environment variable overriding the configured companion script.
pub const SCRIPT_ENV: &str = "PHANTOM_HOST_SCRIPT";

/// Where the configuration comes from.
#[derive(Debug)]
enum Source {
    /// First existing file among the candidates, defaults if none exists.
    Search(Vec<PathBuf>),
    /// A file the user named; it must exist.
    Explicit(PathBuf),
}

/// Loads `BridgeConfig` from TOML, then applies environment overrides.
#[derive(Debug)]
pub struct ConfigLoader {
    source: Source,
}

impl ConfigLoader {
    /// Search `./.phantom-host.toml`, then `<config dir>/phantom-host/config.toml`.
    #[must_use]
    pub fn new() -> Self {
        let mut candidates = vec![PathBuf::from(".phantom-host.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("phantom-host").join("config.toml"));
        }
        Self {
            source: Source::Search(candidates),
        }
    }

    /// Load only `path`. A missing file is an error rather than defaults.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            source: Source::Explicit(path),
        }
    }

    /// Load the configuration.
    ///
    /// `PHANTOM_HOST_BINARY` and `PHANTOM_HOST_SCRIPT` override the file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if an explicit file cannot be read
    /// and `ConfigError::ParseError` if a file is not valid TOML.
    pub fn load(&self) -> Result<BridgeConfig, ConfigError> {
        let config = self.load_file()?;
        Ok(apply_overrides(config, |key| std::env::var(key).ok()))
    }

    fn load_file(&self) -> Result<BridgeConfig, ConfigError> {
        let path = match &self.source {
            Source::Explicit(path) => path.clone(),
            Source::Search(candidates) => match candidates.iter().find(|p| p.exists()) {
                Some(path) => path.clone(),
                None => {
                    tracing::debug!("No config file found, using defaults");
                    return Ok(BridgeConfig::default());
                }
            },
        };
        tracing::debug!(path = %path.display(), "Loading config file");

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadError {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseError { path, source })
    }

    /// Candidate files, in priority order.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        match &self.source {
            Source::Search(candidates) => candidates,
            Source::Explicit(path) => std::slice::from_ref(path),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply environment overrides read through `var`. Empty values are ignored.
fn apply_overrides(mut config: BridgeConfig, var: impl Fn(&str) -> Option<String>) -> BridgeConfig {
    let var = |key: &str| var(key).filter(|value| !value.is_empty());
    if let Some(binary) = var(BINARY_ENV) {
        tracing::debug!(%binary, "Interpreter binary set from environment");
        config.binary = binary;
    }
    if let Some(script) = var(SCRIPT_ENV) {
        tracing::debug!(%script, "Companion script set from environment");
        config.script = Some(PathBuf::from(script));
    }
    config
}

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}
