//! # Engine Configuration
//!
//! Tuning knobs for the bulk writer, scans and the scheduler. Every field has
//! a default, so `EngineConfig::default()` is a working configuration.
//!
//! Configuration can come from three places, applied in this order:
//!
//! 1. Defaults
//! 2. A YAML document (`${VAR}` references are substituted from the
//!    environment before parsing)
//! 3. `PIPEDB_*` environment variables, one per field
//!
//! ```yaml
//! buffer_bytes: 4194304
//! buffer_age_ms: 2000
//! scan_window: 500
//! limit: ${SMOKE_LIMIT}
//! error_limit: 10
//! max_iterations: 100
//! ```

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Bulk writer flushes once this many encoded bytes are buffered.
pub const DEFAULT_BUFFER_BYTES: usize = 1024 * 1024;

/// Bulk writer flushes once its oldest buffered item is this old.
pub const DEFAULT_BUFFER_AGE_MS: u64 = 5_000;

/// Rows fetched per window when scanning records or error entries.
pub const DEFAULT_SCAN_WINDOW: usize = 1_000;

/// Upper bound on scheduler fixed-point passes.
pub const DEFAULT_MAX_ITERATIONS: usize = 1_000;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration shared by every pipe opened through a [`Pipes`](crate::Pipes)
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Size threshold of the bulk writer buffer, in encoded bytes.
    pub buffer_bytes: usize,

    /// Time threshold of the bulk writer buffer, in milliseconds.
    pub buffer_age_ms: u64,

    /// Rows per window in scans and error listings.
    pub scan_window: usize,

    /// Default cap on records processed per `call` (0 = unbounded).
    pub limit: usize,

    /// Default failure count that aborts a `call` (0 = never).
    pub error_limit: usize,

    /// Upper bound on scheduler fixed-point passes.
    pub max_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            buffer_age_ms: DEFAULT_BUFFER_AGE_MS,
            scan_window: DEFAULT_SCAN_WINDOW,
            limit: 0,
            error_limit: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl EngineConfig {
    /// Buffer age threshold as a `Duration`.
    pub fn buffer_age(&self) -> Duration {
        Duration::from_millis(self.buffer_age_ms)
    }

    /// Parses a YAML document after `${VAR}` substitution.
    ///
    /// # Errors
    ///
    /// `Error::Config` if a referenced variable is unset, the YAML is invalid,
    /// or the result fails [`validate`](Self::validate).
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let substituted = substitute_env_vars(yaml)?;
        let config: EngineConfig = if substituted.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(&substituted)
                .map_err(|e| Error::Config(format!("invalid engine config: {e}")))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Applies `PIPEDB_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(name: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{name} is not a valid number: '{raw}'")))
        }

        if let Some(raw) = lookup("PIPEDB_BUFFER_BYTES") {
            self.buffer_bytes = parse("PIPEDB_BUFFER_BYTES", raw)?;
        }
        if let Some(raw) = lookup("PIPEDB_BUFFER_AGE_MS") {
            self.buffer_age_ms = parse("PIPEDB_BUFFER_AGE_MS", raw)?;
        }
        if let Some(raw) = lookup("PIPEDB_SCAN_WINDOW") {
            self.scan_window = parse("PIPEDB_SCAN_WINDOW", raw)?;
        }
        if let Some(raw) = lookup("PIPEDB_LIMIT") {
            self.limit = parse("PIPEDB_LIMIT", raw)?;
        }
        if let Some(raw) = lookup("PIPEDB_ERROR_LIMIT") {
            self.error_limit = parse("PIPEDB_ERROR_LIMIT", raw)?;
        }
        if let Some(raw) = lookup("PIPEDB_MAX_ITERATIONS") {
            self.max_iterations = parse("PIPEDB_MAX_ITERATIONS", raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scan_window == 0 {
            return Err(Error::Config("scan_window must be greater than 0".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// Substitutes `${VAR_NAME}` patterns with environment variable values.
///
/// All missing variables are reported in one error.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(val) => val,
            Err(_) => {
                missing.push(caps[1].to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "missing environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(result.into_owned())
}

// =============================================================================
// Tests
// =============================================================================
