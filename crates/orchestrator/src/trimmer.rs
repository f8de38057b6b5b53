//! Bounded retention of per-invocation message history.
//!
//! A trimmed history is always a contiguous prefix of the original followed
//! by a contiguous suffix; nothing is reordered.

/// Retention cap applied while the monitor reports memory pressure.
pub const PRESSURE_BUDGET: usize = 50;
/// Budgets at or below this keep only the most recent messages.
pub const RECENCY_ONLY_BUDGET: usize = 20;
/// Smallest prefix kept when both ends are retained.
pub const MIN_PREFIX: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimReport {
    pub before: usize,
    pub after: usize,
}

impl TrimReport {
    pub fn dropped(&self) -> usize {
        self.before - self.after
    }
}

pub fn effective_budget(retention_budget: usize, under_pressure: bool) -> usize {
    if under_pressure {
        retention_budget.min(PRESSURE_BUDGET)
    } else {
        retention_budget
    }
}

/// Number of leading messages kept for a given effective budget.
pub fn kept_prefix(effective_budget: usize) -> usize {
    if effective_budget > RECENCY_ONLY_BUDGET {
        MIN_PREFIX.max(effective_budget / 4)
    } else {
        0
    }
}

/// Trim `history` in place to at most the effective budget.
pub fn trim<T>(history: &mut Vec<T>, retention_budget: usize, under_pressure: bool) -> TrimReport {
    let before = history.len();
    let budget = effective_budget(retention_budget, under_pressure);

    if before > budget {
        let prefix = kept_prefix(budget);
        let suffix = budget - prefix;
        history.drain(prefix..before - suffix);
    }

    TrimReport {
        before,
        after: history.len(),
    }
}

/// Copying variant of [`trim`].
pub fn trimmed<T: Clone>(history: &[T], retention_budget: usize, under_pressure: bool) -> Vec<T> {
    let budget = effective_budget(retention_budget, under_pressure);
    if history.len() <= budget {
        return history.to_vec();
    }
    let prefix = kept_prefix(budget);
    let suffix = budget - prefix;
    let mut out = Vec::with_capacity(budget);
    out.extend_from_slice(&history[..prefix]);
    out.extend_from_slice(&history[history.len() - suffix..]);
    out
}
