//! Prometheus metrics for the bridge oracle
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Watcher metrics
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "bridge_oracle_blocks_processed_total",
        "Total number of blocks scanned by watchers",
        &["chain", "event"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "bridge_oracle_latest_block",
        "Latest block number processed",
        &["chain", "event"]
    ).unwrap();

    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "bridge_oracle_chain_head",
        "Latest block number reported by the node",
        &["chain"]
    ).unwrap();

    pub static ref TASKS_RECORDED: CounterVec = register_counter_vec!(
        "bridge_oracle_tasks_recorded_total",
        "Relay tasks created from source chain events",
        &["event"]
    ).unwrap();

    pub static ref DUPLICATE_TASKS: CounterVec = register_counter_vec!(
        "bridge_oracle_duplicate_tasks_total",
        "Events whose task already existed",
        &["event"]
    ).unwrap();

    pub static ref DECODE_ERRORS: CounterVec = register_counter_vec!(
        "bridge_oracle_decode_errors_total",
        "Logs that could not be decoded into a relay payload",
        &["event"]
    ).unwrap();

    // Signature metrics
    pub static ref SIGNATURES_RECORDED: Counter = register_counter!(
        "bridge_oracle_signatures_recorded_total",
        "Validator signatures recorded by this process"
    ).unwrap();

    pub static ref QUORUM_RELEASES: Counter = register_counter!(
        "bridge_oracle_quorum_releases_total",
        "Tasks released to ReadyToSend by reaching quorum"
    ).unwrap();

    // Sender metrics
    pub static ref TRANSACTIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "bridge_oracle_transactions_submitted_total",
        "Destination transactions submitted",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref TASKS_CONFIRMED: CounterVec = register_counter_vec!(
        "bridge_oracle_tasks_confirmed_total",
        "Tasks whose destination transaction reached confirmation depth",
        &["chain"]
    ).unwrap();

    pub static ref TASKS_FAILED: CounterVec = register_counter_vec!(
        "bridge_oracle_tasks_failed_total",
        "Tasks marked Failed",
        &["chain"]
    ).unwrap();

    pub static ref TASKS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "bridge_oracle_tasks",
        "Tasks in the store by status",
        &["status"]
    ).unwrap();

    // Error metrics
    pub static ref RPC_ERRORS: CounterVec = register_counter_vec!(
        "bridge_oracle_rpc_errors_total",
        "RPC errors by class",
        &["chain", "class"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "bridge_oracle_consecutive_failures",
        "Number of consecutive failed worker cycles",
        &["worker"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "bridge_oracle_up",
        "Whether the worker is up and running"
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "bridge_oracle_last_successful_poll_timestamp",
        "Unix timestamp of the last successful worker cycle",
        &["worker"]
    ).unwrap();
}

/// Record a scanned block range
pub fn record_blocks_processed(chain: u64, event: &str, from: u64, to: u64) {
    let chain = chain.to_string();
    BLOCKS_PROCESSED
        .with_label_values(&[&chain, event])
        .inc_by((to + 1).saturating_sub(from) as f64);
    LATEST_BLOCK
        .with_label_values(&[&chain, event])
        .set(to as f64);
}

pub fn set_chain_head(chain: u64, head: u64) {
    CHAIN_HEAD
        .with_label_values(&[&chain.to_string()])
        .set(head as f64);
}

/// Record the outcome of a committed watcher batch
pub fn record_batch(event: &str, inserted: usize, duplicates: usize) {
    TASKS_RECORDED
        .with_label_values(&[event])
        .inc_by(inserted as f64);
    DUPLICATE_TASKS
        .with_label_values(&[event])
        .inc_by(duplicates as f64);
}

pub fn record_decode_error(event: &str) {
    DECODE_ERRORS.with_label_values(&[event]).inc();
}

/// Record a transaction submission
pub fn record_submission(chain: u64, outcome: &str) {
    TRANSACTIONS_SUBMITTED
        .with_label_values(&[&chain.to_string(), outcome])
        .inc();
}

pub fn record_confirmed(chain: u64) {
    TASKS_CONFIRMED.with_label_values(&[&chain.to_string()]).inc();
}

pub fn record_failed(chain: u64) {
    TASKS_FAILED.with_label_values(&[&chain.to_string()]).inc();
}

/// Record an RPC error
pub fn record_rpc_error(chain: u64, class: &str) {
    RPC_ERRORS
        .with_label_values(&[&chain.to_string(), class])
        .inc();
}

pub fn set_task_count(status: &str, count: u64) {
    TASKS_BY_STATUS.with_label_values(&[status]).set(count as f64);
}

/// Update consecutive failures
pub fn set_consecutive_failures(worker: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[worker])
        .set(count as f64);
}

/// Record last successful poll
pub fn record_successful_poll(worker: &str) {
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[worker])
        .set(chrono::Utc::now().timestamp() as f64);
}
