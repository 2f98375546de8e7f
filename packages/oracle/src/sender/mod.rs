//! Sender
//!
//! One sender per destination chain. Each cycle first tracks the tasks this
//! sender already owns (confirming, failing or re-broadcasting them), then
//! claims new ready tasks and submits their destination transactions.
//!
//! The sender keeps the account nonce locally between submissions and only
//! re-reads it from the chain after a nonce error or a deferred submission.
//!
//! Every signed transaction is recorded on its Claimed task before it is
//! broadcast. A restarted sender finds that record, checks its receipt and,
//! when nothing was mined, re-broadcasts with the recorded nonce, so a task
//! never holds two nonces at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256};
use alloy::signers::local::PrivateKeySigner;
use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::aggregator::SignatureAggregator;
use crate::chain::{ChainClient, Receipt};
use crate::error::RpcError;
use crate::metrics;
use crate::store::{retry_on_conflict, TaskStore};
use crate::types::{Fingerprint, RelayTask, Status};

pub mod retry;
pub mod tx;

use retry::{classify_error, ErrorClass, RetryAction, RetryConfig, RetryContext};
use tx::{destination_call, sign_legacy, SignedTransaction};

#[derive(Debug, Clone)]
pub struct SenderSettings {
    /// Claim owner written to the store
    pub sender_id: String,
    /// Bridge contract on the destination chain
    pub bridge: Address,
    pub required_confirmations: u64,
    pub gas_limit: u64,
    /// Tasks claimed per cycle
    pub batch_size: usize,
    /// Blocks without a receipt before a transaction is re-broadcast
    pub resubmit_after_blocks: u64,
    pub poll_interval: Duration,
    pub retry: RetryConfig,
}

/// What one [`Sender::run_once`] cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub submitted: usize,
    pub resubmitted: usize,
    pub confirmed: usize,
    pub failed: usize,
    /// Submissions postponed to a later cycle; the task stays Claimed
    pub deferred: usize,
    /// Sent tasks still waiting for a receipt or confirmation depth
    pub waiting: usize,
}

impl CycleSummary {
    fn count(&mut self, outcome: Submit) {
        match outcome {
            Submit::Sent => self.submitted += 1,
            Submit::Deferred => self.deferred += 1,
            Submit::Failed => self.failed += 1,
        }
    }
}

/// Outcome of one submission attempt sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Submit {
    Sent,
    Deferred,
    Failed,
}

/// Outcome of tracking one Sent task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracked {
    Confirmed,
    Failed,
    Resubmitted,
    Waiting,
}

/// A broadcast destination transaction
#[derive(Debug, Clone)]
struct Submission {
    tx_hash: B256,
    /// Unknown for transactions sent before a restart
    nonce: Option<u64>,
    gas_price: u128,
    sent_at_block: u64,
    /// Earlier broadcasts replaced by a gas bump; any of them may still mine
    previous_hashes: Vec<B256>,
}

impl Submission {
    fn hashes(&self) -> impl Iterator<Item = B256> + '_ {
        std::iter::once(self.tx_hash).chain(self.previous_hashes.iter().copied())
    }
}

pub struct Sender {
    settings: SenderSettings,
    client: Arc<dyn ChainClient>,
    store: Arc<dyn TaskStore>,
    aggregator: Arc<SignatureAggregator>,
    signer: PrivateKeySigner,
    next_nonce: Option<u64>,
    submitted: HashMap<Fingerprint, Submission>,
}

impl Sender {
    pub fn new(
        settings: SenderSettings,
        client: Arc<dyn ChainClient>,
        store: Arc<dyn TaskStore>,
        aggregator: Arc<SignatureAggregator>,
        signer: PrivateKeySigner,
    ) -> Self {
        Self {
            settings,
            client,
            store,
            aggregator,
            signer,
            next_nonce: None,
            submitted: HashMap::new(),
        }
    }

    fn chain_id(&self) -> u64 {
        self.client.chain_id()
    }

    /// Nonce the next new transaction will use, if already known locally
    pub fn next_nonce(&self) -> Option<u64> {
        self.next_nonce
    }

    fn note_rpc_error(&self, e: &RpcError) {
        metrics::record_rpc_error(self.chain_id(), classify_error(e).as_str());
    }

    async fn nonce(&mut self) -> std::result::Result<u64, RpcError> {
        if let Some(nonce) = self.next_nonce {
            return Ok(nonce);
        }
        let nonce = self.client.transaction_count(self.signer.address()).await?;
        debug!(chain_id = self.chain_id(), nonce, "Loaded account nonce from chain");
        self.next_nonce = Some(nonce);
        Ok(nonce)
    }

    fn sign(&self, nonce: u64, gas_price: u128, input: Bytes) -> Result<SignedTransaction> {
        sign_legacy(
            &self.signer,
            self.chain_id(),
            nonce,
            gas_price,
            self.settings.gas_limit,
            self.settings.bridge,
            input,
        )
        .wrap_err("Failed to sign destination transaction")
    }

    async fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        signed: &SignedTransaction,
    ) -> Result<()> {
        retry_on_conflict(|| {
            self.store
                .record_attempt(fingerprint, signed.hash, signed.nonce)
        })
        .await
        .wrap_err_with(|| format!("Failed to record attempt for {}", fingerprint))
    }

    async fn record_rejection(&self, fingerprint: &Fingerprint, reason: &str) -> Result<u32> {
        retry_on_conflict(|| self.store.record_rejection(fingerprint, reason))
            .await
            .wrap_err_with(|| format!("Failed to record rejection of {}", fingerprint))
    }

    async fn mark_sent(&self, fingerprint: &Fingerprint, tx_hash: B256) -> Result<()> {
        retry_on_conflict(|| self.store.mark_sent(fingerprint, tx_hash))
            .await
            .wrap_err_with(|| format!("Failed to mark {} sent", fingerprint))
    }

    async fn fail(&mut self, fingerprint: &Fingerprint, reason: &str) -> Result<()> {
        retry_on_conflict(|| self.store.mark_failed(fingerprint, reason))
            .await
            .wrap_err_with(|| format!("Failed to mark {} failed", fingerprint))?;
        self.submitted.remove(fingerprint);
        metrics::record_failed(self.chain_id());
        error!(%fingerprint, reason, "Task failed");
        Ok(())
    }

    /// Run one sender cycle: track owned tasks, then claim and submit new ones
    pub async fn run_once(&mut self) -> Result<CycleSummary> {
        let chain_id = self.chain_id();
        let head = self
            .client
            .block_number()
            .await
            .inspect_err(|e| self.note_rpc_error(e))
            .wrap_err("Failed to read destination chain head")?;
        metrics::set_chain_head(chain_id, head);

        let mut summary = CycleSummary::default();

        let owned = self
            .store
            .in_flight(chain_id, &self.settings.sender_id)
            .await
            .wrap_err("Failed to load in-flight tasks")?;

        for task in &owned {
            match task.status {
                Status::Sent => match self.track(task, head).await? {
                    Tracked::Confirmed => summary.confirmed += 1,
                    Tracked::Failed => summary.failed += 1,
                    Tracked::Resubmitted => summary.resubmitted += 1,
                    Tracked::Waiting => summary.waiting += 1,
                },
                Status::Claimed => {
                    // Broadcast earlier in this process but never recorded
                    if let Some(tx_hash) = self.submitted.get(&task.fingerprint).map(|s| s.tx_hash)
                    {
                        self.mark_sent(&task.fingerprint, tx_hash).await?;
                        summary.waiting += 1;
                        continue;
                    }
                    // Recorded before a broadcast whose outcome was lost
                    if let Some(tx_hash) = task.destination_tx_hash {
                        match self.client.transaction_receipt(tx_hash).await {
                            Ok(Some(receipt)) => {
                                info!(
                                    fingerprint = %task.fingerprint,
                                    %tx_hash,
                                    block = receipt.block_number,
                                    "Recorded attempt was mined"
                                );
                                self.mark_sent(&task.fingerprint, tx_hash).await?;
                                summary.waiting += 1;
                                continue;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                self.note_rpc_error(&e);
                                warn!(
                                    fingerprint = %task.fingerprint,
                                    %tx_hash,
                                    error = %e,
                                    "Cannot check recorded attempt, deferring"
                                );
                                summary.deferred += 1;
                                continue;
                            }
                        }
                    }
                    debug!(
                        fingerprint = %task.fingerprint,
                        nonce = ?task.destination_nonce,
                        rejections = task.rejection_count,
                        "Resuming claimed task"
                    );
                    let outcome = self.submit(task, head).await?;
                    summary.count(outcome);
                }
                _ => {}
            }
        }

        for _ in 0..self.settings.batch_size {
            let claimed = retry_on_conflict(|| {
                self.store
                    .claim_next_pending(chain_id, &self.settings.sender_id)
            })
            .await
            .wrap_err("Failed to claim task")?;
            let Some(task) = claimed else {
                break;
            };

            info!(
                fingerprint = %task.fingerprint,
                event = %task.event_type,
                attempt = task.attempt_count,
                "Claimed relay task"
            );
            let outcome = self.submit(&task, head).await?;
            summary.count(outcome);
        }

        if summary != CycleSummary::default() {
            info!(
                chain_id,
                submitted = summary.submitted,
                resubmitted = summary.resubmitted,
                confirmed = summary.confirmed,
                failed = summary.failed,
                deferred = summary.deferred,
                waiting = summary.waiting,
                "Sender cycle complete"
            );
        }
        Ok(summary)
    }

    /// Build, sign and broadcast a claimed task's destination transaction
    async fn submit(&mut self, task: &RelayTask, head: u64) -> Result<Submit> {
        let fingerprint = task.fingerprint;
        let chain_id = self.chain_id();

        let input = match destination_call(task, &self.aggregator) {
            Ok(input) => input,
            Err(e) => {
                self.fail(&fingerprint, &format!("cannot build destination call: {}", e))
                    .await?;
                return Ok(Submit::Failed);
            }
        };

        let base_gas_price = match self.client.gas_price().await {
            Ok(price) => price,
            Err(e) => {
                self.note_rpc_error(&e);
                warn!(%fingerprint, error = %e, "Cannot read gas price, deferring");
                metrics::record_submission(chain_id, "deferred");
                return Ok(Submit::Deferred);
            }
        };

        let mut ctx = RetryContext::new(self.settings.retry.clone(), base_gas_price)
            .with_prior_rejections(task.rejection_count);
        let mut gas_price = base_gas_price;
        // A resumed task keeps the nonce of its recorded attempt, which may
        // still be pending
        let mut pinned_nonce = task.destination_nonce;

        loop {
            let nonce = match pinned_nonce {
                Some(nonce) => nonce,
                None => match self.nonce().await {
                    Ok(nonce) => {
                        pinned_nonce = Some(nonce);
                        nonce
                    }
                    Err(e) => {
                        self.note_rpc_error(&e);
                        warn!(%fingerprint, error = %e, "Cannot read account nonce, deferring");
                        metrics::record_submission(chain_id, "deferred");
                        return Ok(Submit::Deferred);
                    }
                },
            };

            let signed = self.sign(nonce, gas_price, input.clone())?;
            self.record_attempt(&fingerprint, &signed).await?;
            debug!(
                %fingerprint,
                tx_hash = %signed.hash,
                nonce,
                gas_price,
                failures = ctx.failures(),
                rejections = ctx.rejections(),
                "Broadcasting destination transaction"
            );

            let error = match self.client.send_raw_transaction(signed.raw.clone()).await {
                Ok(_) => {
                    self.record_sent(&fingerprint, &signed, head).await?;
                    return Ok(Submit::Sent);
                }
                Err(e) => e,
            };

            self.note_rpc_error(&error);
            warn!(
                %fingerprint,
                nonce,
                gas_price,
                class = classify_error(&error).as_str(),
                error = %error,
                "Destination transaction rejected"
            );
            ctx.record_failure(error);
            if !ctx.last_was_unavailable() {
                let reason = ctx.last_error().map(|e| e.to_string()).unwrap_or_default();
                let total = self.record_rejection(&fingerprint, &reason).await?;
                debug!(%fingerprint, rejections = total, "Recorded rejection");
            }

            match ctx.next_action() {
                RetryAction::Backoff(delay) => tokio::time::sleep(delay).await,
                RetryAction::BumpGas {
                    after,
                    gas_price: bumped,
                } => {
                    gas_price = bumped;
                    tokio::time::sleep(after).await;
                }
                RetryAction::RefreshNonce { after } => {
                    tokio::time::sleep(after).await;
                    let pending = match self.client.transaction_count(self.signer.address()).await {
                        Ok(count) => count,
                        Err(e) => {
                            self.note_rpc_error(&e);
                            self.next_nonce = None;
                            metrics::record_submission(chain_id, "deferred");
                            return Ok(Submit::Deferred);
                        }
                    };
                    let refreshed = if ctx.last_class() == ErrorClass::NonceTooLow {
                        pending.max(nonce + 1)
                    } else {
                        pending
                    };
                    debug!(%fingerprint, old = nonce, new = refreshed, "Refreshed account nonce");
                    self.next_nonce = Some(refreshed);
                    pinned_nonce = Some(refreshed);
                }
                RetryAction::AlreadySubmitted => {
                    self.record_sent(&fingerprint, &signed, head).await?;
                    return Ok(Submit::Sent);
                }
                RetryAction::Defer => {
                    // The node may or may not have seen the nonce
                    self.next_nonce = None;
                    metrics::record_submission(chain_id, "deferred");
                    return Ok(Submit::Deferred);
                }
                RetryAction::DeadLetter => {
                    metrics::record_submission(chain_id, "rejected");
                    let reason = ctx
                        .last_error()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "submission failed".to_string());
                    self.fail(&fingerprint, &reason).await?;
                    return Ok(Submit::Failed);
                }
            }
        }
    }

    async fn record_sent(
        &mut self,
        fingerprint: &Fingerprint,
        signed: &SignedTransaction,
        head: u64,
    ) -> Result<()> {
        // An unknown local nonce stays unknown; a pinned nonce may lag the chain
        self.next_nonce = self.next_nonce.map(|n| n.max(signed.nonce + 1));

        // Remembered before the store write so a failed write is healed next cycle
        self.submitted.insert(
            *fingerprint,
            Submission {
                tx_hash: signed.hash,
                nonce: Some(signed.nonce),
                gas_price: signed.gas_price,
                sent_at_block: head,
                previous_hashes: Vec::new(),
            },
        );
        self.mark_sent(fingerprint, signed.hash).await?;

        metrics::record_submission(self.chain_id(), "sent");
        info!(
            %fingerprint,
            tx_hash = %signed.hash,
            nonce = signed.nonce,
            "Destination transaction sent"
        );
        Ok(())
    }

    /// Check the receipts of a Sent task's broadcasts
    async fn track(&mut self, task: &RelayTask, head: u64) -> Result<Tracked> {
        let fingerprint = task.fingerprint;
        let Some(current) = task.destination_tx_hash else {
            return Err(eyre::eyre!("Sent task {} has no transaction hash", fingerprint));
        };

        let submission = self
            .submitted
            .entry(fingerprint)
            .or_insert_with(|| Submission {
                tx_hash: current,
                nonce: task.destination_nonce,
                gas_price: 0,
                sent_at_block: head,
                previous_hashes: Vec::new(),
            })
            .clone();

        let mut mined: Option<Receipt> = None;
        let mut reverted: Option<Receipt> = None;
        for hash in submission.hashes() {
            match self.client.transaction_receipt(hash).await {
                Ok(Some(receipt)) if receipt.success => {
                    mined = Some(receipt);
                    break;
                }
                Ok(Some(receipt)) => reverted = Some(receipt),
                Ok(None) => {}
                Err(e) => {
                    self.note_rpc_error(&e);
                    warn!(%fingerprint, tx_hash = %hash, error = %e, "Receipt lookup failed");
                    return Ok(Tracked::Waiting);
                }
            }
        }

        if let Some(receipt) = mined {
            if receipt.transaction_hash != current {
                info!(
                    %fingerprint,
                    tx_hash = %receipt.transaction_hash,
                    "Earlier broadcast was mined"
                );
                self.mark_sent(&fingerprint, receipt.transaction_hash).await?;
            }

            let depth = head.saturating_sub(receipt.block_number);
            if depth < self.settings.required_confirmations {
                debug!(%fingerprint, depth, "Waiting for confirmation depth");
                return Ok(Tracked::Waiting);
            }

            retry_on_conflict(|| self.store.mark_confirmed(&fingerprint))
                .await
                .wrap_err_with(|| format!("Failed to mark {} confirmed", fingerprint))?;
            self.submitted.remove(&fingerprint);
            metrics::record_confirmed(self.chain_id());
            info!(
                %fingerprint,
                tx_hash = %receipt.transaction_hash,
                block = receipt.block_number,
                depth,
                "Relay confirmed"
            );
            return Ok(Tracked::Confirmed);
        }

        if let Some(receipt) = reverted {
            self.fail(
                &fingerprint,
                &format!("destination transaction {} reverted", receipt.transaction_hash),
            )
            .await?;
            return Ok(Tracked::Failed);
        }

        if head.saturating_sub(submission.sent_at_block) < self.settings.resubmit_after_blocks {
            return Ok(Tracked::Waiting);
        }
        self.resubmit(task, submission, head).await
    }

    /// Re-broadcast a stuck transaction with the same nonce and a higher gas price
    async fn resubmit(
        &mut self,
        task: &RelayTask,
        mut submission: Submission,
        head: u64,
    ) -> Result<Tracked> {
        let fingerprint = task.fingerprint;

        let input = match destination_call(task, &self.aggregator) {
            Ok(input) => input,
            Err(e) => {
                self.fail(&fingerprint, &format!("cannot build destination call: {}", e))
                    .await?;
                return Ok(Tracked::Failed);
            }
        };

        let network = match self.client.gas_price().await {
            Ok(price) => price,
            Err(e) => {
                self.note_rpc_error(&e);
                return Ok(Tracked::Waiting);
            }
        };
        let retry = &self.settings.retry;
        let gas_price = retry
            .bumped_gas_price(submission.gas_price, 1)
            .min(retry.gas_ceiling(network))
            .max(network);

        // Tasks sent before nonces were recorded have none; the replacement
        // then takes a fresh one and the bridge rejects whichever copy
        // executes second
        let nonce = match submission.nonce {
            Some(nonce) => nonce,
            None => match self.nonce().await {
                Ok(nonce) => nonce,
                Err(e) => {
                    self.note_rpc_error(&e);
                    return Ok(Tracked::Waiting);
                }
            },
        };

        let signed = self.sign(nonce, gas_price, input)?;
        match self.client.send_raw_transaction(signed.raw.clone()).await {
            Ok(_) => {}
            Err(e) if classify_error(&e) == ErrorClass::AlreadyKnown => {}
            Err(e) => {
                self.note_rpc_error(&e);
                // Nonce too low here usually means an earlier copy was mined
                warn!(
                    %fingerprint,
                    nonce,
                    error = %e,
                    "Re-broadcast rejected, waiting for receipts"
                );
                submission.sent_at_block = head;
                self.submitted.insert(fingerprint, submission);
                return Ok(Tracked::Waiting);
            }
        }

        if submission.nonce.is_none() {
            let next = nonce + 1;
            self.next_nonce = Some(self.next_nonce.map_or(next, |n| n.max(next)));
        }
        submission.previous_hashes.push(submission.tx_hash);
        submission.tx_hash = signed.hash;
        submission.nonce = Some(nonce);
        submission.gas_price = gas_price;
        submission.sent_at_block = head;
        self.submitted.insert(fingerprint, submission);

        self.mark_sent(&fingerprint, signed.hash).await?;
        metrics::record_submission(self.chain_id(), "resubmitted");
        info!(
            %fingerprint,
            tx_hash = %signed.hash,
            nonce,
            gas_price,
            "Re-broadcast destination transaction"
        );
        Ok(Tracked::Resubmitted)
    }

    /// Run cycles until shutdown, backing off exponentially after failures
    pub async fn run(&mut self, name: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            sender = %name,
            chain_id = self.chain_id(),
            sender_id = %self.settings.sender_id,
            bridge = %self.settings.bridge,
            account = %self.signer.address(),
            "Starting sender"
        );

        let mut consecutive_failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(summary) => {
                    consecutive_failures = 0;
                    metrics::record_successful_poll(name);
                    // A full batch means more work is probably waiting
                    if summary.submitted + summary.failed + summary.deferred
                        >= self.settings.batch_size
                        && summary.deferred == 0
                    {
                        Duration::ZERO
                    } else {
                        self.settings.poll_interval
                    }
                }
                Err(e) => {
                    let backoff = self.settings.retry.backoff(consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    error!(
                        sender = %name,
                        error = ?e,
                        consecutive_failures,
                        ?backoff,
                        "Sender cycle failed"
                    );
                    backoff
                }
            };
            metrics::set_consecutive_failures(name, consecutive_failures);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(sender = %name, "Sender stopped");
        Ok(())
    }
}
