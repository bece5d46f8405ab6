//! Simulation metrics.

use std::collections::VecDeque;

use corebank_common::LedgerError;

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total operations attempted.
    pub total_operations: u64,
    /// Operations that committed.
    pub successful_operations: u64,
    /// Operations the ledger rejected (funds, not found, count mismatch).
    pub rejected_operations: u64,
    /// Operations still conflicting after every retry.
    pub conflicted_operations: u64,
    /// Operations that failed in storage.
    pub failed_operations: u64,
    /// Records settled by successful captures.
    pub captured_records: u64,
    /// Latency samples (ms).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            rejected_operations: 0,
            conflicted_operations: 0,
            failed_operations: 0,
            captured_records: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a committed operation.
    pub fn record_success(&mut self, latency_ms: u64) {
        self.total_operations += 1;
        self.successful_operations += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    /// Record a failed operation, bucketed by error kind.
    pub fn record_error(&mut self, err: &LedgerError) {
        self.total_operations += 1;

        if err.is_client_error() {
            self.rejected_operations += 1;
        } else if err.is_retryable() {
            self.conflicted_operations += 1;
        } else {
            self.failed_operations += 1;
        }
    }

    /// Count records settled by a capture.
    pub fn record_captured(&mut self, records: usize) {
        self.captured_records += records as u64;
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_ms(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }

        self.successful_operations as f64 / self.total_operations as f64
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corebank_common::{AccountId, TransactionId};

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_success(100);
        metrics.record_success(200);
        metrics.record_success(150);
        metrics.record_error(&LedgerError::AccountNotFound(AccountId::new()));

        assert_eq!(metrics.total_operations, 4);
        assert_eq!(metrics.successful_operations, 3);
        assert_eq!(metrics.rejected_operations, 1);
        assert_eq!(metrics.average_latency_ms(), 150);
        assert_eq!(metrics.p50_latency_ms(), 150);
        assert_eq!(metrics.success_rate(), 0.75);
    }

    #[test]
    fn test_error_buckets() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_error(&LedgerError::TransactionNotFound(TransactionId::new()));
        metrics.record_error(&LedgerError::SerializationConflict("busy".into()));
        metrics.record_error(&LedgerError::StorageUnavailable("down".into()));

        assert_eq!(metrics.rejected_operations, 1);
        assert_eq!(metrics.conflicted_operations, 1);
        assert_eq!(metrics.failed_operations, 1);
        assert_eq!(metrics.p99_latency_ms(), 0);
    }
}
