//! Process configuration sourced from the environment
//!
//! All `BUILDER_*` environment variables recognized by the core are parsed
//! here, in one place, so the rest of the codebase never reads the process
//! environment directly.

use std::path::PathBuf;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;
const DAY_SECS: u64 = 24 * 60 * 60;

/// Size, count, and age budgets for one cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudget {
    /// Maximum total encoded size in bytes
    pub max_bytes: u64,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Entries idle longer than this are discarded
    pub max_age: Duration,
}

impl CacheBudget {
    /// Defaults for the target-level cache: 10 GiB, 10,000 entries, 30 days.
    pub fn targets() -> Self {
        CacheBudget {
            max_bytes: 10 * GIB,
            max_entries: 10_000,
            max_age: Duration::from_secs(30 * DAY_SECS),
        }
    }

    /// Defaults for the action-level cache: 1 GiB, 50,000 entries, 30 days.
    pub fn actions() -> Self {
        CacheBudget {
            max_bytes: GIB,
            max_entries: 50_000,
            max_age: Duration::from_secs(30 * DAY_SECS),
        }
    }

    /// Target-cache budget with `BUILDER_CACHE_MAX_SIZE`,
    /// `BUILDER_CACHE_MAX_ENTRIES`, and `BUILDER_CACHE_MAX_AGE_DAYS` applied.
    pub fn targets_from_env() -> Self {
        Self::targets().overridden(
            "BUILDER_CACHE_MAX_SIZE",
            "BUILDER_CACHE_MAX_ENTRIES",
            "BUILDER_CACHE_MAX_AGE_DAYS",
        )
    }

    /// Action-cache budget with the `BUILDER_ACTION_CACHE_*` triple applied.
    pub fn actions_from_env() -> Self {
        Self::actions().overridden(
            "BUILDER_ACTION_CACHE_MAX_SIZE",
            "BUILDER_ACTION_CACHE_MAX_ENTRIES",
            "BUILDER_ACTION_CACHE_MAX_AGE_DAYS",
        )
    }

    fn overridden(mut self, size_var: &str, entries_var: &str, age_var: &str) -> Self {
        if let Some(bytes) = env_u64(size_var) {
            self.max_bytes = bytes;
        }
        if let Some(entries) = env_u64(entries_var) {
            self.max_entries = entries as usize;
        }
        if let Some(days) = env_u64(age_var) {
            self.max_age = Duration::from_secs(days * DAY_SECS);
        }
        self
    }
}

/// Options controlling a single build session.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Worker thread count
    pub workers: usize,
    /// Stop dispatching new work after the first failure
    pub fail_fast: bool,
    /// Apply a valid checkpoint before scheduling (the `resume` flow)
    pub resume: bool,
    /// Per-node cooperative deadline; `None` means unbounded
    pub node_timeout: Option<Duration>,
    /// Whole-session deadline; `None` means unbounded
    pub global_timeout: Option<Duration>,
    /// Cache directory, relative to the workspace
    pub cache_dir: PathBuf,
    /// Output directory, relative to the workspace
    pub output_dir: PathBuf,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            workers: default_worker_count(),
            fail_fast: false,
            resume: false,
            node_timeout: None,
            global_timeout: None,
            cache_dir: PathBuf::from(".builder-cache"),
            output_dir: PathBuf::from("build-out"),
        }
    }
}

impl BuildOptions {
    /// Defaults with `BUILDER_WORKERS` applied.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(workers) = env_u64("BUILDER_WORKERS") {
            if workers > 0 {
                options.workers = workers as usize;
            }
        }
        options
    }
}

/// Worker count auto-detected from the CPU count.
pub fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

/// Whether `BUILDER_VERBOSE` requests debug-level logging.
pub fn verbose_from_env() -> bool {
    match std::env::var("BUILDER_VERBOSE") {
        Ok(value) => parse_bool(&value),
        Err(_) => false,
    }
}

/// The workspace MAC seed, when `BUILDER_WORKSPACE_KEY` is set.
pub fn workspace_key_from_env() -> Option<String> {
    std::env::var("BUILDER_WORKSPACE_KEY")
        .ok()
        .filter(|key| !key.is_empty())
}

fn env_u64(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match parse_u64(&raw) {
        Some(value) => Some(value),
        None => {
            log::warn!("Ignoring unparsable {}={:?}", var, raw);
            None
        }
    }
}

fn parse_u64(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "yes" | "on")
}
