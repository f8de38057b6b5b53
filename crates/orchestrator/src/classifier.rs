//! Failure classification and recovery decisions.
//!
//! Each attempt of a phase moves `Attempting -> {Succeeded, TransientClassified,
//! FatalClassified}`. An error raised while consuming the agent's stream is
//! transient only if its text matches a known teardown/cancellation marker;
//! everything else is fatal and propagated unchanged. A transient error is
//! then resolved by evidence: recovered when the phase's output already
//! exists, retried while attempts remain, escalated to manual intervention
//! otherwise.

use std::time::Duration;

use buildloop_core::{FailureKind, FailureRecord, PhaseKind};
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Signatures of the agent's teardown races, matched case-insensitively.
pub const DEFAULT_TRANSIENT_MARKERS: [&str; 7] = [
    r"unhandled errors in a taskgroup",
    r"taskgroup",
    r"exceptiongroup",
    r"cancel scope",
    r"cancelled during (teardown|cleanup|shutdown)",
    r"generatorexit",
    r"broken pipe",
];

/// Bounded retry for transient failures, from `[retry]` in the project config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// What the runner should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Unrecognized error: propagate as-is.
    Fatal,
    /// Transient error, but the evidence shows the work is done.
    Recovered,
    /// Transient error without evidence; run the attempt again after `delay`.
    Retry { delay: Duration },
    /// Transient error, no evidence, no attempts left.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    markers: RegexSet,
    policy: RetryPolicy,
}

impl FailureClassifier {
    pub fn new() -> Self {
        Self::with_markers(DEFAULT_TRANSIENT_MARKERS).expect("built-in transient markers are valid")
    }

    pub fn with_markers<I, S>(markers: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let markers = RegexSetBuilder::new(markers).case_insensitive(true).build()?;
        Ok(Self {
            markers,
            policy: RetryPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_transient(&self, message: &str) -> bool {
        self.markers.is_match(message)
    }

    /// Marker patterns that matched, for logging.
    pub fn matched_markers(&self, message: &str) -> Vec<&str> {
        self.markers
            .matches(message)
            .into_iter()
            .map(|i| self.markers.patterns()[i].as_str())
            .collect()
    }

    /// Classify an error raised while consuming the stream of `attempt`.
    pub fn classify(&self, phase: PhaseKind, attempt: u32, message: &str) -> FailureRecord {
        let kind = if self.is_transient(message) {
            debug!(
                phase = %phase,
                attempt,
                markers = ?self.matched_markers(message),
                "Transient protocol error recognized"
            );
            FailureKind::TransientProtocol
        } else {
            FailureKind::Unrecognized
        };
        FailureRecord::new(phase, attempt, kind, message)
    }

    /// Decide the next step for a classified failure. Evidence, when the
    /// runner checked it, is read from the record.
    pub fn decide(&self, record: &FailureRecord) -> Recovery {
        if !record.is_transient_cleanup_error {
            return Recovery::Fatal;
        }
        if record.evidence.as_ref().is_some_and(|e| e.satisfied) {
            return Recovery::Recovered;
        }
        if record.attempt < self.policy.max_attempts {
            Recovery::Retry {
                delay: self.policy.delay(),
            }
        } else {
            Recovery::Exhausted
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}
