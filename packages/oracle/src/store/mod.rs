//! Task Store
//!
//! Durable, idempotent storage of relay tasks keyed by fingerprint. The
//! store is the only coordination point between watcher and sender
//! processes: claims, quorum release and status changes are atomic here.
//!
//! Two implementations share the [`TaskStore`] trait: the Postgres store in
//! [`crate::db`] for production and [`MemoryTaskStore`] for tests and dry runs.

use std::future::Future;
use std::time::Duration;

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;
use crate::types::{ChainCursor, EventKind, Fingerprint, RelayTask, Status};

pub mod memory;

pub use memory::MemoryTaskStore;

/// Attempts made by [`retry_on_conflict`] before giving up
pub const CONFLICT_RETRIES: u32 = 5;

/// Result of inserting a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The fingerprint already existed; nothing about the task changed
    Duplicate,
}

/// Result of recording one validator signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOutcome {
    /// New signature; `count` distinct validators have now signed
    Recorded { count: usize },
    /// This validator had already signed; nothing changed
    Duplicate { count: usize },
    /// This signature reached the quorum and moved the task to ReadyToSend
    Released,
}

/// Key of a co-signing scan: tasks are visited by source block, then
/// source transaction and log index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanPosition {
    pub source_block: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl ScanPosition {
    pub fn of(task: &RelayTask) -> Self {
        Self {
            source_block: task.source_block,
            tx_hash: task.fingerprint.tx_hash,
            log_index: task.fingerprint.log_index,
        }
    }
}

/// Summary of one watcher batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    /// Tasks this batch released to ReadyToSend
    pub released: usize,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task together with the signatures it carries
    ///
    /// An existing fingerprint is left untouched apart from recording any
    /// carried signatures not yet present.
    async fn upsert(&self, task: &RelayTask) -> Result<UpsertOutcome, StoreError>;

    /// Claim the oldest Pending or ReadyToSend task for a destination
    ///
    /// The task moves to Claimed with `claimed_by = sender_id`, its attempt
    /// count incremented and `last_attempt_at` stamped. A fingerprint is never
    /// handed to two claimants.
    async fn claim_next_pending(
        &self,
        destination_chain_id: u64,
        sender_id: &str,
    ) -> Result<Option<RelayTask>, StoreError>;

    /// Idempotently add a validator signature, releasing the task once the
    /// quorum is reached
    async fn record_signature(
        &self,
        fingerprint: &Fingerprint,
        validator_id: &str,
        signature: Bytes,
    ) -> Result<SignatureOutcome, StoreError>;

    /// Record a signed destination transaction before it is broadcast
    ///
    /// Only Claimed tasks accept an attempt; the status stays Claimed. Crash
    /// recovery checks this hash's receipt before signing anything new.
    async fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        tx_hash: B256,
        nonce: u64,
    ) -> Result<(), StoreError>;

    /// Count one node rejection of a Claimed task's transaction and keep its
    /// message; returns the rejection total across every submission round
    async fn record_rejection(
        &self,
        fingerprint: &Fingerprint,
        reason: &str,
    ) -> Result<u32, StoreError>;

    /// Claimed or Sent → Sent with the given destination transaction
    async fn mark_sent(&self, fingerprint: &Fingerprint, tx_hash: B256) -> Result<(), StoreError>;

    /// Sent → Confirmed
    async fn mark_confirmed(&self, fingerprint: &Fingerprint) -> Result<(), StoreError>;

    /// Any non-terminal status → Failed
    async fn mark_failed(&self, fingerprint: &Fingerprint, reason: &str) -> Result<(), StoreError>;

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<RelayTask>, StoreError>;

    async fn load_cursor(
        &self,
        chain_id: u64,
        event_type: EventKind,
    ) -> Result<Option<ChainCursor>, StoreError>;

    /// Upsert every task of a watcher batch and advance its cursor as one
    /// atomic operation
    ///
    /// The cursor never moves backwards.
    async fn commit_batch(
        &self,
        cursor: &ChainCursor,
        tasks: &[RelayTask],
    ) -> Result<BatchOutcome, StoreError>;

    /// Claimed and Sent tasks owned by `sender_id`, oldest first
    async fn in_flight(
        &self,
        destination_chain_id: u64,
        sender_id: &str,
    ) -> Result<Vec<RelayTask>, StoreError>;

    /// Task count for every status, in lifecycle order
    async fn count_by_status(&self) -> Result<Vec<(Status, u64)>, StoreError>;

    /// Most recent tasks with the given status
    async fn list_by_status(&self, status: Status, limit: usize)
        -> Result<Vec<RelayTask>, StoreError>;

    /// AwaitingQuorum tasks from one source chain and event type that
    /// `validator_id` has not signed, in [`ScanPosition`] order strictly
    /// after `after`
    async fn awaiting_signature(
        &self,
        chain_id: u64,
        event_type: EventKind,
        validator_id: &str,
        after: Option<ScanPosition>,
        limit: usize,
    ) -> Result<Vec<RelayTask>, StoreError>;
}

/// Re-run an atomic store operation while it fails with a persistence
/// conflict
pub async fn retry_on_conflict<T, F, Fut>(mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(e) if e.is_conflict() && attempt + 1 < CONFLICT_RETRIES => {
                attempt += 1;
                warn!(attempt, error = %e, "Persistence conflict, retrying");
                tokio::time::sleep(Duration::from_millis(10 * 2u64.pow(attempt))).await;
            }
            result => return result,
        }
    }
}

/// Status a task should be stored with once it holds `signatures`
/// distinct signatures
pub(crate) fn status_after_signatures(status: Status, signatures: usize, quorum: usize) -> Status {
    if status == Status::AwaitingQuorum && signatures >= quorum {
        Status::ReadyToSend
    } else {
        status
    }
}
