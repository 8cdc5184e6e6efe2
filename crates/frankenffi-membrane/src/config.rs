//! Runtime configuration.
//!
//! Values are read from environment variables with loose parsing; malformed
//! values fall back to defaults rather than failing start-up:
//! - `FRANKENFFI_CARRIERS`: carrier threads (default: available parallelism).
//! - `FRANKENFFI_NATIVE_THREADS`: native-call threads (default: carriers, at least 2).
//! - `FRANKENFFI_CANCEL_CHECK_MS`: cancellation check interval (default: none).
//! - `FRANKENFFI_ARENA_CHUNK`: bump chunk size in bytes (default: 4096).
//! - `FRANKENFFI_ARENA_MAX_BYTES`: per-arena byte budget (default: unlimited).
//! - `FRANKENFFI_LIBRARY_PATH`: `:`-separated libraries searched before the process.
//! - `FRANKENFFI_LOG`: `off|error|warn|info|debug` (default: `warn`).

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

pub const ENV_CARRIERS: &str = "FRANKENFFI_CARRIERS";
pub const ENV_NATIVE_THREADS: &str = "FRANKENFFI_NATIVE_THREADS";
pub const ENV_CANCEL_CHECK_MS: &str = "FRANKENFFI_CANCEL_CHECK_MS";
pub const ENV_ARENA_CHUNK: &str = "FRANKENFFI_ARENA_CHUNK";
pub const ENV_ARENA_MAX_BYTES: &str = "FRANKENFFI_ARENA_MAX_BYTES";
pub const ENV_LIBRARY_PATH: &str = "FRANKENFFI_LIBRARY_PATH";
pub const ENV_LOG: &str = "FRANKENFFI_LOG";

/// Default bump chunk for arena allocations.
pub const DEFAULT_ARENA_CHUNK: usize = 4096;

/// Minimum severity that reaches the log sink.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogFilter {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
}

impl LogFilter {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Self::Off,
            "error" | "err" => Self::Error,
            "info" => Self::Info,
            "debug" | "trace" | "all" => Self::Debug,
            _ => Self::Warn,
        }
    }
}

/// Process-wide runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub carriers: usize,
    pub native_threads: usize,
    pub cancel_check_interval: Option<Duration>,
    pub arena_chunk_size: usize,
    pub arena_max_bytes: Option<usize>,
    pub library_path: Vec<PathBuf>,
    pub log: LogFilter,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let carriers = default_carriers();
        Self {
            carriers,
            native_threads: carriers.max(2),
            cancel_check_interval: None,
            arena_chunk_size: DEFAULT_ARENA_CHUNK,
            arena_max_bytes: None,
            library_path: Vec::new(),
            log: LogFilter::default(),
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = lookup(ENV_CARRIERS).as_deref().and_then(parse_count) {
            config.carriers = n;
            config.native_threads = n.max(2);
        }
        if let Some(n) = lookup(ENV_NATIVE_THREADS).as_deref().and_then(parse_count) {
            config.native_threads = n;
        }
        config.cancel_check_interval = lookup(ENV_CANCEL_CHECK_MS)
            .as_deref()
            .and_then(parse_count)
            .map(|ms| Duration::from_millis(ms as u64));
        if let Some(n) = lookup(ENV_ARENA_CHUNK).as_deref().and_then(parse_count) {
            config.arena_chunk_size = n;
        }
        config.arena_max_bytes = lookup(ENV_ARENA_MAX_BYTES).as_deref().and_then(parse_count);
        if let Some(raw) = lookup(ENV_LIBRARY_PATH) {
            config.library_path = raw
                .split(':')
                .filter(|entry| !entry.trim().is_empty())
                .map(|entry| PathBuf::from(entry.trim()))
                .collect();
        }
        if let Some(raw) = lookup(ENV_LOG) {
            config.log = LogFilter::from_str_loose(&raw);
        }
        config
    }

    #[must_use]
    pub fn with_carriers(mut self, carriers: usize) -> Self {
        self.carriers = carriers.max(1);
        self
    }

    #[must_use]
    pub fn with_native_threads(mut self, threads: usize) -> Self {
        self.native_threads = threads.max(1);
        self
    }

    #[must_use]
    pub fn with_cancel_check_interval(mut self, interval: Duration) -> Self {
        self.cancel_check_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_arena_chunk_size(mut self, bytes: usize) -> Self {
        self.arena_chunk_size = bytes.max(64);
        self
    }

    #[must_use]
    pub fn with_arena_max_bytes(mut self, bytes: usize) -> Self {
        self.arena_max_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path.push(path.into());
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: LogFilter) -> Self {
        self.log = log;
        self
    }
}

static GLOBAL_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Configuration read from the environment on first use, cached thereafter.
#[must_use]
pub fn runtime_config() -> &'static RuntimeConfig {
    GLOBAL_CONFIG.get_or_init(RuntimeConfig::from_env)
}

fn default_carriers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Positive integer, accepting `_` separators. Zero and garbage yield `None`.
fn parse_count(raw: &str) -> Option<usize> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != '_').collect();
    cleaned.parse::<usize>().ok().filter(|n| *n > 0)
}
