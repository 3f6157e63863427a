//! Metrics definitions for the merge engine.
//!
//! This module defines all metrics recorded during a merge run.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "merge_balance_movements_total",
        "Total number of conservation-checked balance movements"
    );
    describe_counter!(
        "merge_mints_total",
        "Total number of mints performed against the destination ledger"
    );
    describe_counter!(
        "merge_accounts_migrated_total",
        "Total number of accounts marked as migrated"
    );
    describe_counter!(
        "merge_accounts_created_total",
        "Total number of accounts created during the merge"
    );
    describe_counter!(
        "merge_skipped_rows_total",
        "Total number of skipped reconciliation rows and movements"
    );
    describe_counter!(
        "merge_dropped_denoms_total",
        "Total number of balances dropped because their denom is not convertible"
    );
    describe_histogram!(
        "merge_stage_duration_seconds",
        "Time taken by each pipeline stage in seconds"
    );
}

/// Record a balance movement.
pub fn record_balance_movement() {
    counter!("merge_balance_movements_total").increment(1);
}

/// Record a mint.
pub fn record_mint() {
    counter!("merge_mints_total").increment(1);
}

/// Record an account marked as migrated.
pub fn record_account_migrated() {
    counter!("merge_accounts_migrated_total").increment(1);
}

/// Record an account created during the merge.
///
/// # Arguments
/// * `reason` - Why the account had to be created
pub fn record_account_created(reason: &str) {
    counter!("merge_accounts_created_total", "reason" => reason.to_string()).increment(1);
}

/// Record a skipped row.
///
/// # Arguments
/// * `reason` - Skip reason ("missing_account", "sequence", ...)
pub fn record_skipped_row(reason: &str) {
    counter!("merge_skipped_rows_total", "reason" => reason.to_string()).increment(1);
}

/// Record a denom dropped during conversion.
pub fn record_dropped_denom(denom: &str) {
    counter!("merge_dropped_denoms_total", "denom" => denom.to_string()).increment(1);
}

/// Record stage duration.
pub fn record_stage_duration(stage: &'static str, duration_secs: f64) {
    histogram!("merge_stage_duration_seconds", "stage" => stage).record(duration_secs);
}

/// A timer that records a stage duration when dropped.
pub struct StageTimer {
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    /// Start timing `stage`.
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        record_stage_duration(self.stage, self.start.elapsed().as_secs_f64());
    }
}
