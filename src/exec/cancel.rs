//! Cooperative cancellation tokens
//!
//! Tokens are cloned into every handler invocation; handlers are expected to
//! poll `state()` at convenient points and return promptly once tripped.
//! Nothing is ever killed from outside. A token may carry a deadline, which
//! reports as its own state so timeouts stay distinguishable from explicit
//! cancellation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Why a token was tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// External interrupt (Ctrl-C)
    UserInterrupt,
    /// A fatal error elsewhere in the build
    FatalError,
    /// Fail-fast shutdown after another node failed
    FailFast,
}

/// Observed token state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// Keep working
    Active,
    /// Tripped; stop as soon as practical
    Cancelled(CancelReason),
    /// The deadline passed
    DeadlineExceeded,
}

struct Trip {
    tripped: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
}

/// Shared cancellation token. Clones and children observe the same trip; a
/// child may carry its own deadline.
#[derive(Clone)]
pub struct CancellationToken {
    trip: Arc<Trip>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// A token that never expires on its own.
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    /// A token that reports `DeadlineExceeded` after `deadline`.
    pub fn with_deadline(deadline: Option<Instant>) -> Self {
        CancellationToken {
            trip: Arc::new(Trip {
                tripped: AtomicBool::new(false),
                reason: Mutex::new(None),
            }),
            deadline,
        }
    }

    /// A token sharing this one's trip but with its own deadline. Tripping
    /// either trips both.
    pub fn child(&self, deadline: Option<Instant>) -> CancellationToken {
        CancellationToken {
            trip: Arc::clone(&self.trip),
            deadline: deadline.or(self.deadline),
        }
    }

    /// Trip the token. The first reason wins; later trips are no-ops.
    pub fn trip(&self, reason: CancelReason) {
        if !self.trip.tripped.swap(true, Ordering::SeqCst) {
            *self.trip.reason.lock() = Some(reason);
        }
    }

    /// Current state. An explicit trip takes precedence over the deadline.
    pub fn state(&self) -> CancelState {
        if self.trip.tripped.load(Ordering::SeqCst) {
            let reason = (*self.trip.reason.lock()).unwrap_or(CancelReason::FatalError);
            return CancelState::Cancelled(reason);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return CancelState::DeadlineExceeded;
            }
        }
        CancelState::Active
    }

    /// True when work should stop, for whatever reason.
    pub fn is_cancelled(&self) -> bool {
        self.state() != CancelState::Active
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
