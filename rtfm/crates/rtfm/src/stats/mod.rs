//! Stats Module - Transaction Monitoring
//!
//! Per-context counters for tuning and debugging:
//! - Transaction outcomes per reason
//! - Lock and debug retries
//! - Hit-set efficiency (logged, deduplicated, stack-skipped writes)
//! - Write-log size per outer transaction

pub mod histogram;

pub use histogram::Histogram;

use crate::transaction::RecordOutcome;

/// TransactionStats - statistics collector of one context
#[derive(Debug, Clone, Default)]
pub struct TransactionStats {
    transactions_started: u64,
    nested_started: u64,
    committed: u64,
    aborted_by_request: u64,
    aborted_by_language: u64,
    aborted_by_cascade: u64,
    aborted_by_failed_lock: u64,
    lock_retries: u64,
    debug_retries: u64,
    writes_logged: u64,
    writes_deduplicated: u64,
    writes_stack_skipped: u64,
    bytes_logged: u64,
    commit_tasks_run: u64,
    abort_tasks_run: u64,
    /// Write-log entries per finished outer transaction
    log_entries: Histogram,
    /// Logged bytes per finished outer transaction
    log_bytes: Histogram,
}

impl TransactionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&mut self, nested: bool) {
        if nested {
            self.nested_started += 1;
        } else {
            self.transactions_started += 1;
        }
    }

    pub fn record_write(&mut self, outcome: RecordOutcome) {
        self.writes_logged += outcome.logged as u64;
        self.writes_deduplicated += outcome.already_logged as u64;
        self.writes_stack_skipped += outcome.stack_skipped as u64;
        self.bytes_logged += outcome.bytes as u64;
    }

    pub fn record_commit(&mut self, tasks_run: usize) {
        self.committed += 1;
        self.commit_tasks_run += tasks_run as u64;
    }

    pub fn record_abort(&mut self, reason: crate::Abort, tasks_run: usize) {
        match reason {
            crate::Abort::ByRequest => self.aborted_by_request += 1,
            crate::Abort::ByLanguage => self.aborted_by_language += 1,
            crate::Abort::Cascade => self.aborted_by_cascade += 1,
            crate::Abort::FailedLockAcquisition => self.aborted_by_failed_lock += 1,
        }
        self.abort_tasks_run += tasks_run as u64;
    }

    pub fn record_lock_retry(&mut self) {
        self.lock_retries += 1;
    }

    pub fn record_debug_retry(&mut self) {
        self.debug_retries += 1;
    }

    /// Record the final write-log size of an outer transaction
    pub fn record_log_size(&mut self, entries: usize, bytes: usize) {
        self.log_entries.record(entries as u64);
        self.log_bytes.record(bytes as u64);
    }

    pub fn log_entries(&self) -> &Histogram {
        &self.log_entries
    }

    pub fn log_bytes(&self) -> &Histogram {
        &self.log_bytes
    }

    /// Get summary statistics
    pub fn summary(&self) -> StatsSummary {
        let lookups = self.writes_logged + self.writes_deduplicated;
        StatsSummary {
            transactions_started: self.transactions_started,
            nested_started: self.nested_started,
            committed: self.committed,
            aborted_by_request: self.aborted_by_request,
            aborted_by_language: self.aborted_by_language,
            aborted_by_cascade: self.aborted_by_cascade,
            aborted_by_failed_lock: self.aborted_by_failed_lock,
            lock_retries: self.lock_retries,
            debug_retries: self.debug_retries,
            writes_logged: self.writes_logged,
            writes_deduplicated: self.writes_deduplicated,
            writes_stack_skipped: self.writes_stack_skipped,
            bytes_logged: self.bytes_logged,
            commit_tasks_run: self.commit_tasks_run,
            abort_tasks_run: self.abort_tasks_run,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.writes_deduplicated as f64 / lookups as f64
            },
            p50_log_entries: self.log_entries.p50(),
            max_log_bytes: self.log_bytes.max(),
        }
    }

    /// Reset statistics
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Summary statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StatsSummary {
    /// Outer transactions started (retries not counted)
    pub transactions_started: u64,
    /// Nested transactions started
    pub nested_started: u64,
    /// Transactions committed, nested included
    pub committed: u64,
    pub aborted_by_request: u64,
    pub aborted_by_language: u64,
    pub aborted_by_cascade: u64,
    /// Commits refused by the lock hook
    pub aborted_by_failed_lock: u64,
    pub lock_retries: u64,
    pub debug_retries: u64,
    pub writes_logged: u64,
    pub writes_deduplicated: u64,
    pub writes_stack_skipped: u64,
    pub bytes_logged: u64,
    pub commit_tasks_run: u64,
    pub abort_tasks_run: u64,
    /// Share of heap writes already covered by the hit set
    pub hit_rate: f64,
    pub p50_log_entries: u64,
    pub max_log_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Abort;

    #[test]
    fn test_counts_outcomes() {
        let mut stats = TransactionStats::new();
        stats.record_start(false);
        stats.record_start(true);
        stats.record_commit(2);
        stats.record_abort(Abort::ByRequest, 1);
        stats.record_abort(Abort::FailedLockAcquisition, 0);
        stats.record_lock_retry();

        let summary = stats.summary();
        assert_eq!(summary.transactions_started, 1);
        assert_eq!(summary.nested_started, 1);
        assert_eq!(summary.committed, 1);
        assert_eq!(summary.aborted_by_request, 1);
        assert_eq!(summary.aborted_by_failed_lock, 1);
        assert_eq!(summary.lock_retries, 1);
        assert_eq!(summary.commit_tasks_run, 2);
        assert_eq!(summary.abort_tasks_run, 1);
    }

    #[test]
    fn test_hit_rate() {
        let mut stats = TransactionStats::new();
        stats.record_write(RecordOutcome {
            logged: 1,
            already_logged: 3,
            stack_skipped: 2,
            bytes: 8,
        });
        let summary = stats.summary();
        assert_eq!(summary.hit_rate, 0.75);
        assert_eq!(summary.bytes_logged, 8);
        assert_eq!(summary.writes_stack_skipped, 2);
    }

    #[test]
    fn test_reset() {
        let mut stats = TransactionStats::new();
        stats.record_log_size(4, 64);
        stats.record_commit(0);
        stats.reset();
        assert_eq!(stats.summary(), StatsSummary::default());
        assert_eq!(stats.log_entries().count(), 0);
    }
}
