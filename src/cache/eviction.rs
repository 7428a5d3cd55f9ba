//! Eviction selection under size, count, and age budgets
//!
//! Policy: discard least-recently-accessed entries until total size and
//! entry count fit their budgets, and discard any entry idle beyond the age
//! cap regardless of pressure. Ties on `last_access` break by `timestamp`
//! (older first), then by key ascending, so selection is deterministic.

use crate::core::config::CacheBudget;

/// Minimal view of an entry for eviction purposes.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    /// Cache key
    pub key: String,
    /// Encoded size in bytes
    pub size: u64,
    /// Creation time, unix seconds
    pub timestamp: u64,
    /// Last access time, unix seconds
    pub last_access: u64,
}

/// Choose the keys to discard. The input order does not matter; the output
/// is the eviction set in eviction order.
pub fn select_evictions(
    candidates: &[EvictionCandidate],
    budget: &CacheBudget,
    now: u64,
) -> Vec<String> {
    let max_age = budget.max_age.as_secs();
    let mut evicted = Vec::new();
    let mut survivors: Vec<&EvictionCandidate> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        if now.saturating_sub(candidate.last_access) > max_age {
            evicted.push(candidate.key.clone());
        } else {
            survivors.push(candidate);
        }
    }

    let mut total: u64 = survivors.iter().map(|c| c.size).sum();
    let mut count = survivors.len();
    if total <= budget.max_bytes && count <= budget.max_entries {
        return evicted;
    }

    survivors.sort_by(|a, b| {
        a.last_access
            .cmp(&b.last_access)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.key.cmp(&b.key))
    });

    for candidate in survivors {
        if total <= budget.max_bytes && count <= budget.max_entries {
            break;
        }
        total -= candidate.size;
        count -= 1;
        evicted.push(candidate.key.clone());
    }

    evicted
}
