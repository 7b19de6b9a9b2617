//! Per-test statistics and failure-rate changepoint estimation.

pub mod failure_rates;
pub mod test_stats;

pub use failure_rates::SequentialFailureRates;
pub use test_stats::{StatsSummary, TestStats, UPDATE_INTERVAL_SECS};
