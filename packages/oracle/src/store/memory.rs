//! In-memory task store for tests and dry runs
//!
//! Every operation takes a single lock, which gives it the same atomicity
//! the Postgres store gets from transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use chrono::Utc;

use super::{
    status_after_signatures, BatchOutcome, ScanPosition, SignatureOutcome, TaskStore,
    UpsertOutcome,
};
use crate::error::StoreError;
use crate::types::{ChainCursor, EventKind, Fingerprint, RelayTask, Status};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Fingerprint, RelayTask>,
    /// Insertion order, used as "oldest first"
    order: Vec<Fingerprint>,
    cursors: HashMap<(u64, EventKind), u64>,
}

impl Inner {
    fn task_mut(&mut self, fingerprint: &Fingerprint) -> Result<&mut RelayTask, StoreError> {
        self.tasks
            .get_mut(fingerprint)
            .ok_or(StoreError::NotFound(*fingerprint))
    }

    fn insert(&mut self, task: &RelayTask, quorum: usize) -> (UpsertOutcome, usize) {
        let (outcome, mut released) = if self.tasks.contains_key(&task.fingerprint) {
            (UpsertOutcome::Duplicate, 0)
        } else {
            let mut stored = task.clone();
            stored.signatures.clear();
            self.tasks.insert(task.fingerprint, stored);
            self.order.push(task.fingerprint);
            (UpsertOutcome::Inserted, 0)
        };

        for (validator, signature) in &task.signatures {
            // The task was inserted above, so this cannot be NotFound
            if let Ok(SignatureOutcome::Released) =
                self.record(&task.fingerprint, validator, signature.clone(), quorum)
            {
                released += 1;
            }
        }
        (outcome, released)
    }

    fn record(
        &mut self,
        fingerprint: &Fingerprint,
        validator_id: &str,
        signature: Bytes,
        quorum: usize,
    ) -> Result<SignatureOutcome, StoreError> {
        let task = self.task_mut(fingerprint)?;
        if task.signatures.contains_key(validator_id) {
            return Ok(SignatureOutcome::Duplicate {
                count: task.signature_count(),
            });
        }

        task.signatures.insert(validator_id.to_string(), signature);
        let count = task.signature_count();
        let next = status_after_signatures(task.status, count, quorum);
        if next != task.status {
            task.status = next;
            return Ok(SignatureOutcome::Released);
        }
        Ok(SignatureOutcome::Recorded { count })
    }

    /// A task that must still be Claimed
    fn claimed_mut(&mut self, fingerprint: &Fingerprint) -> Result<&mut RelayTask, StoreError> {
        let task = self.task_mut(fingerprint)?;
        if task.status != Status::Claimed {
            return Err(StoreError::InvalidTransition {
                fingerprint: *fingerprint,
                from: task.status,
                to: Status::Claimed,
            });
        }
        Ok(task)
    }

    fn transition(
        &mut self,
        fingerprint: &Fingerprint,
        allowed_from: &[Status],
        to: Status,
    ) -> Result<&mut RelayTask, StoreError> {
        let task = self.task_mut(fingerprint)?;
        if !allowed_from.contains(&task.status) || !task.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                fingerprint: *fingerprint,
                from: task.status,
                to,
            });
        }
        task.status = to;
        Ok(task)
    }
}

/// Task store held entirely in process memory
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
    quorum: usize,
    injected_conflicts: AtomicU32,
}

impl MemoryTaskStore {
    pub fn new(quorum: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            quorum: quorum.max(1),
            injected_conflicts: AtomicU32::new(0),
        }
    }

    /// Make the next `count` batch commits, signature writes or sent marks
    /// fail with a persistence conflict, without side effects
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every task in insertion order
    pub fn all_tasks(&self) -> Vec<RelayTask> {
        self.lock()
            .map(|inner| {
                inner
                    .order
                    .iter()
                    .filter_map(|fp| inner.tasks.get(fp).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
    }

    fn take_injected_conflict(&self) -> Result<(), StoreError> {
        let taken = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::PersistenceConflict(
                "injected serialization failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn upsert(&self, task: &RelayTask) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.insert(task, self.quorum).0)
    }

    async fn claim_next_pending(
        &self,
        destination_chain_id: u64,
        sender_id: &str,
    ) -> Result<Option<RelayTask>, StoreError> {
        let mut inner = self.lock()?;
        let next = inner.order.iter().copied().find(|fp| {
            inner.tasks.get(fp).is_some_and(|task| {
                task.destination_chain_id == destination_chain_id && task.status.is_claimable()
            })
        });
        let Some(fingerprint) = next else {
            return Ok(None);
        };

        let task = inner.task_mut(&fingerprint)?;
        task.status = Status::Claimed;
        task.claimed_by = Some(sender_id.to_string());
        task.attempt_count += 1;
        task.last_attempt_at = Some(Utc::now());
        Ok(Some(task.clone()))
    }

    async fn record_signature(
        &self,
        fingerprint: &Fingerprint,
        validator_id: &str,
        signature: Bytes,
    ) -> Result<SignatureOutcome, StoreError> {
        self.take_injected_conflict()?;
        let mut inner = self.lock()?;
        inner.record(fingerprint, validator_id, signature, self.quorum)
    }

    async fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        tx_hash: B256,
        nonce: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let task = inner.claimed_mut(fingerprint)?;
        task.destination_tx_hash = Some(tx_hash);
        task.destination_nonce = Some(nonce);
        task.last_attempt_at = Some(Utc::now());
        Ok(())
    }

    async fn record_rejection(
        &self,
        fingerprint: &Fingerprint,
        reason: &str,
    ) -> Result<u32, StoreError> {
        let mut inner = self.lock()?;
        let task = inner.claimed_mut(fingerprint)?;
        task.rejection_count += 1;
        task.error_message = Some(reason.to_string());
        Ok(task.rejection_count)
    }

    async fn mark_sent(&self, fingerprint: &Fingerprint, tx_hash: B256) -> Result<(), StoreError> {
        self.take_injected_conflict()?;
        let mut inner = self.lock()?;
        let task = inner.transition(fingerprint, &[Status::Claimed, Status::Sent], Status::Sent)?;
        task.destination_tx_hash = Some(tx_hash);
        task.last_attempt_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_confirmed(&self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.transition(fingerprint, &[Status::Sent], Status::Confirmed)?;
        Ok(())
    }

    async fn mark_failed(&self, fingerprint: &Fingerprint, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let task = inner.transition(
            fingerprint,
            &[
                Status::Pending,
                Status::AwaitingQuorum,
                Status::ReadyToSend,
                Status::Claimed,
                Status::Sent,
            ],
            Status::Failed,
        )?;
        task.error_message = Some(reason.to_string());
        Ok(())
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<RelayTask>, StoreError> {
        Ok(self.lock()?.tasks.get(fingerprint).cloned())
    }

    async fn load_cursor(
        &self,
        chain_id: u64,
        event_type: EventKind,
    ) -> Result<Option<ChainCursor>, StoreError> {
        Ok(self
            .lock()?
            .cursors
            .get(&(chain_id, event_type))
            .map(|&last_processed_block| ChainCursor {
                chain_id,
                event_type,
                last_processed_block,
            }))
    }

    async fn commit_batch(
        &self,
        cursor: &ChainCursor,
        tasks: &[RelayTask],
    ) -> Result<BatchOutcome, StoreError> {
        self.take_injected_conflict()?;
        let mut inner = self.lock()?;

        let mut outcome = BatchOutcome::default();
        for task in tasks {
            let (upserted, released) = inner.insert(task, self.quorum);
            match upserted {
                UpsertOutcome::Inserted => outcome.inserted += 1,
                UpsertOutcome::Duplicate => outcome.duplicates += 1,
            }
            outcome.released += released;
        }

        let stored = inner
            .cursors
            .entry((cursor.chain_id, cursor.event_type))
            .or_insert(cursor.last_processed_block);
        *stored = (*stored).max(cursor.last_processed_block);

        Ok(outcome)
    }

    async fn in_flight(
        &self,
        destination_chain_id: u64,
        sender_id: &str,
    ) -> Result<Vec<RelayTask>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|fp| inner.tasks.get(fp))
            .filter(|task| {
                task.destination_chain_id == destination_chain_id
                    && matches!(task.status, Status::Claimed | Status::Sent)
                    && task.claimed_by.as_deref() == Some(sender_id)
            })
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> Result<Vec<(Status, u64)>, StoreError> {
        let inner = self.lock()?;
        Ok(Status::ALL
            .into_iter()
            .map(|status| {
                let count = inner.tasks.values().filter(|t| t.status == status).count();
                (status, count as u64)
            })
            .collect())
    }

    async fn list_by_status(
        &self,
        status: Status,
        limit: usize,
    ) -> Result<Vec<RelayTask>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|fp| inner.tasks.get(fp))
            .filter(|task| task.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn awaiting_signature(
        &self,
        chain_id: u64,
        event_type: EventKind,
        validator_id: &str,
        after: Option<ScanPosition>,
        limit: usize,
    ) -> Result<Vec<RelayTask>, StoreError> {
        let inner = self.lock()?;
        let mut unsigned: Vec<(ScanPosition, &RelayTask)> = inner
            .tasks
            .values()
            .filter(|task| {
                task.status == Status::AwaitingQuorum
                    && task.fingerprint.chain_id == chain_id
                    && task.event_type == event_type
                    && !task.signatures.contains_key(validator_id)
            })
            .map(|task| (ScanPosition::of(task), task))
            .filter(|(position, _)| after.map_or(true, |after| *position > after))
            .collect();
        unsigned.sort_by_key(|(position, _)| *position);

        Ok(unsigned
            .into_iter()
            .take(limit)
            .map(|(_, task)| task.clone())
            .collect())
    }
}
