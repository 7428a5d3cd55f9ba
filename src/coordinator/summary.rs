//! End-of-build summary

use std::fmt;
use std::time::Duration;

/// Counts reported at the end of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    /// Nodes built by a handler this session
    pub built: usize,
    /// Nodes satisfied from cache or checkpoint
    pub cached: usize,
    /// Nodes that failed, directly or by cascade
    pub failed: usize,
    /// Nodes deliberately not attempted
    pub skipped: usize,
    /// Wall time for the whole session
    pub elapsed: Duration,
}

impl BuildSummary {
    /// True when nothing failed.
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Total nodes accounted for.
    pub fn total(&self) -> usize {
        self.built + self.cached + self.failed + self.skipped
    }
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} built, {} cached, {} failed, {} skipped in {:.2}s",
            self.built,
            self.cached,
            self.failed,
            self.skipped,
            self.elapsed.as_secs_f64()
        )
    }
}
