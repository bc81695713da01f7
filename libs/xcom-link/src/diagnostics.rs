//! Link statistics kept by the engine task

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::transaction::TransactionState;

/// Width of one duration histogram bucket
pub const DURATION_BUCKET_MS: u64 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkDiagnostics {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Transmissions per finished transaction -> count
    pub attempts: BTreeMap<u32, u64>,
    /// Duration bucket (multiples of 100 ms, lower bound) -> count
    pub durations_ms: BTreeMap<u64, u64>,
    pub checksum_errors: u64,
    pub unsolicited: u64,
    pub ambiguous: u64,
}

impl LinkDiagnostics {
    /// Account for a transaction leaving the table
    pub fn record(&mut self, state: TransactionState, attempts: u32, elapsed: Duration) {
        match state {
            TransactionState::Completed => self.completed += 1,
            TransactionState::Failed => self.failed += 1,
            TransactionState::TimedOut => self.timed_out += 1,
            TransactionState::Cancelled => {
                self.cancelled += 1;
                return;
            },
            TransactionState::Pending => return,
        }

        *self.attempts.entry(attempts).or_default() += 1;
        let bucket = (elapsed.as_millis() as u64 / DURATION_BUCKET_MS) * DURATION_BUCKET_MS;
        *self.durations_ms.entry(bucket).or_default() += 1;
    }

    /// Transactions that reached a final state
    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.timed_out + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histograms() {
        let mut diag = LinkDiagnostics::default();
        diag.record(TransactionState::Completed, 1, Duration::from_millis(42));
        diag.record(TransactionState::Completed, 1, Duration::from_millis(99));
        diag.record(TransactionState::Completed, 2, Duration::from_millis(350));
        diag.record(TransactionState::TimedOut, 3, Duration::from_millis(9_000));
        diag.record(TransactionState::Cancelled, 1, Duration::from_millis(10));

        assert_eq!(diag.completed, 3);
        assert_eq!(diag.timed_out, 1);
        assert_eq!(diag.cancelled, 1);
        assert_eq!(diag.total(), 5);

        assert_eq!(diag.attempts.get(&1), Some(&2));
        assert_eq!(diag.attempts.get(&3), Some(&1));
        assert_eq!(diag.durations_ms.get(&0), Some(&2));
        assert_eq!(diag.durations_ms.get(&300), Some(&1));
        assert_eq!(diag.durations_ms.get(&9_000), Some(&1));
    }
}
