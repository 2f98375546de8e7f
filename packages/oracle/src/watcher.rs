//! Event Watcher
//!
//! One watcher per (source chain, event type). Each cycle reads the persisted
//! cursor, scans the confirmed block range past it, turns qualifying logs
//! into relay tasks and commits tasks and cursor together.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolCall;
use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::aggregator::SignatureAggregator;
use crate::chain::{ChainClient, LogEntry};
use crate::contracts::HomeBridge;
use crate::error::{DecodeError, RpcError};
use crate::events::{decode_log, event_signature, LogLocation, RelayPayload};
use crate::metrics;
use crate::sender::retry::RetryConfig;
use crate::store::{retry_on_conflict, ScanPosition, TaskStore};
use crate::types::{ChainCursor, EventKind, Fingerprint, RelayTask, Status};

/// Unsigned tasks fetched per co-signing page
const COSIGN_PAGE: usize = 100;

/// Watcher state machine: `Idle → Polling → Processing → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    /// Reading the cursor and chain head
    Polling,
    /// Fetching, decoding and committing a block range
    Processing,
}

/// Result of one [`EventWatcher::poll_once`] cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing confirmed past the cursor yet
    UpToDate { head: u64 },
    Processed {
        head: u64,
        from: u64,
        to: u64,
        inserted: usize,
        duplicates: usize,
        /// `false` when the range was clamped and more confirmed blocks remain
        caught_up: bool,
    },
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub name: String,
    pub event_type: EventKind,
    /// Contract emitting the watched event
    pub contract: Address,
    /// Foreign bridge address; Transfer events to anything else are ignored
    pub bridge: Address,
    pub destination_chain_id: u64,
    pub required_confirmations: u64,
    /// First block scanned when no cursor is stored
    pub start_block: u64,
    pub max_block_range: u64,
    pub poll_interval: Duration,
    pub retry: RetryConfig,
}

pub struct EventWatcher {
    settings: WatcherSettings,
    client: Arc<dyn ChainClient>,
    store: Arc<dyn TaskStore>,
    aggregator: Arc<SignatureAggregator>,
    state: watch::Sender<WatcherState>,
}

impl EventWatcher {
    pub fn new(
        settings: WatcherSettings,
        client: Arc<dyn ChainClient>,
        store: Arc<dyn TaskStore>,
        aggregator: Arc<SignatureAggregator>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            settings,
            client,
            store,
            aggregator,
            state,
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    fn set_state(&self, state: WatcherState) {
        self.state.send_replace(state);
    }

    fn chain_id(&self) -> u64 {
        self.client.chain_id()
    }

    /// Run one watcher cycle
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let result = self.poll_inner().await;
        if let Ok(outcome) = &result {
            let head = match outcome {
                PollOutcome::UpToDate { head } | PollOutcome::Processed { head, .. } => *head,
            };
            if let Err(e) = self.cosign_pending(head).await {
                warn!(
                    chain_id = self.chain_id(),
                    event = %self.settings.event_type,
                    error = ?e,
                    "Co-signing pass failed"
                );
            }
        }
        self.set_state(WatcherState::Idle);
        result
    }

    /// Sign tasks another validator recorded, once this validator's own node
    /// shows the same event at the required depth
    ///
    /// The cursor is shared per (chain, event type), so only the first
    /// validator to scan a range builds its tasks; the rest sign here.
    pub async fn cosign_pending(&self, head: u64) -> Result<usize> {
        let event = self.settings.event_type;
        if self.aggregator.is_single_validator() || !event.requires_validator_signature() {
            return Ok(0);
        }

        let chain_id = self.chain_id();
        let validator = self.aggregator.validator_id();
        let mut signed = 0;
        let mut after = None;

        'scan: loop {
            let page = self
                .store
                .awaiting_signature(chain_id, event, validator, after, COSIGN_PAGE)
                .await
                .wrap_err("Failed to list tasks awaiting this validator")?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(ScanPosition::of(last));

            for task in &page {
                // Pages run oldest block first, so everything after is shallower
                if head.saturating_sub(task.source_block) < self.settings.required_confirmations {
                    break 'scan;
                }
                if !self.matches_chain(task).await? {
                    continue;
                }
                let outcome = self.aggregator.submit(self.store.as_ref(), task).await?;
                debug!(fingerprint = %task.fingerprint, ?outcome, "Co-signed relay task");
                signed += 1;
            }

            if page.len() < COSIGN_PAGE {
                break;
            }
        }

        if signed > 0 {
            info!(chain_id, event = %event, signed, "Co-signed tasks awaiting quorum");
        }
        Ok(signed)
    }

    /// Whether this validator's node has the task's log with the same payload
    async fn matches_chain(&self, task: &RelayTask) -> Result<bool> {
        let event = self.settings.event_type;
        let logs = self.rpc(
            self.client
                .get_logs(
                    self.settings.contract,
                    event_signature(event),
                    task.source_block,
                    task.source_block,
                )
                .await,
        )?;

        let log = logs.iter().find(|log| {
            log.transaction_hash == Some(task.fingerprint.tx_hash)
                && log.log_index == Some(task.fingerprint.log_index)
        });
        match log.map(|log| decode_log(event, log)) {
            Some(Ok(payload)) if payload == task.payload => Ok(true),
            Some(_) => {
                warn!(fingerprint = %task.fingerprint, "Stored payload differs from chain, not signing");
                Ok(false)
            }
            None => {
                warn!(fingerprint = %task.fingerprint, "Task log not found on this node, not signing");
                Ok(false)
            }
        }
    }

    async fn poll_inner(&self) -> Result<PollOutcome> {
        let chain_id = self.chain_id();
        let event = self.settings.event_type;
        self.set_state(WatcherState::Polling);

        let cursor = self
            .store
            .load_cursor(chain_id, event)
            .await
            .wrap_err("Failed to load cursor")?;
        let next_block = cursor
            .map(|c| c.last_processed_block + 1)
            .unwrap_or(self.settings.start_block);

        let head = self.rpc(self.client.block_number().await)?;
        metrics::set_chain_head(chain_id, head);

        let confirmed = head.saturating_sub(self.settings.required_confirmations);
        if confirmed < next_block {
            debug!(
                chain_id,
                event = %event,
                head,
                next_block,
                "No confirmed blocks past cursor"
            );
            return Ok(PollOutcome::UpToDate { head });
        }

        let range = self.settings.max_block_range.max(1);
        let to = confirmed.min(next_block.saturating_add(range - 1));

        self.set_state(WatcherState::Processing);
        let logs = self.rpc(
            self.client
                .get_logs(self.settings.contract, event_signature(event), next_block, to)
                .await,
        )?;

        let mut tasks = Vec::with_capacity(logs.len());
        for log in &logs {
            if let Some(task) = self.build_task(log, head).await? {
                tasks.push(task);
            }
        }

        let new_cursor = ChainCursor {
            chain_id,
            event_type: event,
            last_processed_block: to,
        };
        let outcome = retry_on_conflict(|| self.store.commit_batch(&new_cursor, &tasks))
            .await
            .wrap_err("Failed to commit watcher batch")?;

        metrics::record_blocks_processed(chain_id, event.as_str(), next_block, to);
        metrics::record_batch(event.as_str(), outcome.inserted, outcome.duplicates);
        if outcome.released > 0 {
            metrics::QUORUM_RELEASES.inc_by(outcome.released as f64);
        }

        info!(
            chain_id,
            event = %event,
            from_block = next_block,
            to_block = to,
            logs = logs.len(),
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "Processed block range"
        );

        Ok(PollOutcome::Processed {
            head,
            from: next_block,
            to,
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
            caught_up: to == confirmed,
        })
    }

    fn rpc<T>(&self, result: std::result::Result<T, RpcError>) -> Result<T> {
        result.map_err(|e| {
            let class = if e.is_retryable() { "unavailable" } else { "rejected" };
            metrics::record_rpc_error(self.chain_id(), class);
            eyre::Report::new(e)
        })
    }

    /// Turn a log into a task; `None` for malformed or irrelevant logs
    async fn build_task(&self, log: &LogEntry, head: u64) -> Result<Option<RelayTask>> {
        let event = self.settings.event_type;
        let decoded = LogLocation::of(log).and_then(|loc| Ok((loc, decode_log(event, log)?)));
        let (location, payload) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                metrics::record_decode_error(event.as_str());
                warn!(
                    chain_id = self.chain_id(),
                    event = %event,
                    tx_hash = ?log.transaction_hash,
                    log_index = ?log.log_index,
                    error = %e,
                    "Skipping undecodable log"
                );
                return Ok(None);
            }
        };

        let fingerprint = Fingerprint::new(self.chain_id(), location.tx_hash, location.log_index);

        let payload = match payload {
            RelayPayload::Transfer { to, .. } if to != self.settings.bridge => {
                return Ok(None);
            }
            RelayPayload::CollectedSignatures {
                authority,
                message_hash,
                signature_count,
                ..
            } => {
                if authority != self.aggregator.address() {
                    debug!(%fingerprint, %authority, "Another validator relays these signatures");
                    return Ok(None);
                }
                let max_signers = self.aggregator.max_signers();
                if signature_count > max_signers as u64 {
                    let e = DecodeError::Malformed {
                        kind: event,
                        reason: format!(
                            "{} collected signatures but at most {} validators",
                            signature_count, max_signers
                        ),
                    };
                    metrics::record_decode_error(event.as_str());
                    warn!(%fingerprint, error = %e, "Skipping undecodable log");
                    return Ok(None);
                }
                let (message, signatures) =
                    self.fetch_collected(message_hash, signature_count).await?;
                RelayPayload::CollectedSignatures {
                    authority,
                    message_hash,
                    signature_count,
                    message,
                    signatures,
                }
            }
            other => other,
        };

        let status = if !event.requires_validator_signature() {
            Status::ReadyToSend
        } else if self.aggregator.is_single_validator() {
            Status::Pending
        } else {
            Status::AwaitingQuorum
        };

        let mut task = RelayTask::new(
            fingerprint,
            self.settings.destination_chain_id,
            payload,
            location.block_number,
            head.saturating_sub(location.block_number),
            status,
        );

        if event.requires_validator_signature() {
            let signature = self
                .aggregator
                .attest(&task)
                .wrap_err_with(|| format!("Failed to sign task {}", fingerprint))?;
            task.add_signature(signature);
        }

        debug!(%fingerprint, status = %task.status, "Built relay task");
        Ok(Some(task))
    }

    /// Read the stored message and collected signatures from the home bridge
    async fn fetch_collected(
        &self,
        message_hash: B256,
        count: u64,
    ) -> Result<(Bytes, Vec<Bytes>)> {
        let contract = self.settings.contract;

        let call = HomeBridge::messageCall { hash: message_hash };
        let raw = self.rpc(self.client.call(contract, call.abi_encode().into()).await)?;
        let message = HomeBridge::messageCall::abi_decode_returns(&raw, true)
            .wrap_err("Failed to decode message() result")?
            ._0;

        let mut signatures = Vec::with_capacity(count as usize);
        for index in 0..count {
            let call = HomeBridge::signatureCall {
                hash: message_hash,
                index: U256::from(index),
            };
            let raw = self.rpc(self.client.call(contract, call.abi_encode().into()).await)?;
            let signature = HomeBridge::signatureCall::abi_decode_returns(&raw, true)
                .wrap_err("Failed to decode signature() result")?
                ._0;
            signatures.push(signature);
        }

        Ok((message, signatures))
    }

    /// Poll until shutdown, backing off exponentially after failures
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let name = self.settings.name.clone();
        info!(
            watcher = %name,
            chain_id = self.chain_id(),
            contract = %self.settings.contract,
            confirmations = self.settings.required_confirmations,
            "Starting event watcher"
        );

        let mut consecutive_failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.poll_once().await {
                Ok(outcome) => {
                    consecutive_failures = 0;
                    metrics::record_successful_poll(&name);
                    match outcome {
                        PollOutcome::Processed {
                            caught_up: false, ..
                        } => Duration::ZERO,
                        _ => self.settings.poll_interval,
                    }
                }
                Err(e) => {
                    let backoff = self.settings.retry.backoff(consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    error!(
                        watcher = %name,
                        error = ?e,
                        consecutive_failures,
                        ?backoff,
                        "Watcher cycle failed"
                    );
                    backoff
                }
            };
            metrics::set_consecutive_failures(&name, consecutive_failures);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(watcher = %name, "Event watcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::log_for;
    use crate::store::MemoryTaskStore;
    use crate::testing::{fast_retry, MockChain};
    use alloy::signers::local::PrivateKeySigner;
    use alloy::sol_types::SolValue;
    use std::collections::HashMap;

    const FOREIGN: u64 = 2;

    fn settings(event_type: EventKind, confirmations: u64) -> WatcherSettings {
        WatcherSettings {
            name: "test-watcher".to_string(),
            event_type,
            contract: Address::repeat_byte(0x0c),
            bridge: Address::repeat_byte(0x0b),
            destination_chain_id: FOREIGN,
            required_confirmations: confirmations,
            start_block: 0,
            max_block_range: 1_000,
            poll_interval: Duration::from_millis(10),
            retry: fast_retry(),
        }
    }

    fn watcher(
        settings: WatcherSettings,
        chain: Arc<MockChain>,
        store: Arc<MemoryTaskStore>,
        quorum: usize,
    ) -> EventWatcher {
        let signer = PrivateKeySigner::random();
        let bridges = HashMap::from([(FOREIGN, Address::repeat_byte(0x0b)), (1, Address::ZERO)]);
        let aggregator = Arc::new(SignatureAggregator::new(signer, quorum, Vec::new(), bridges));
        EventWatcher::new(settings, chain, store, aggregator)
    }

    fn request_log(block: u64, index: u64) -> LogEntry {
        let data = (Address::repeat_byte(0xaa), U256::from(10u64)).abi_encode_params();
        log_for(EventKind::SignatureRequest, vec![], data, block, index)
    }

    #[tokio::test]
    async fn test_confirmation_depth_gates_task_creation() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(1));
        let w = watcher(
            settings(EventKind::SignatureRequest, 5),
            chain.clone(),
            store.clone(),
            1,
        );

        chain.push_log(request_log(100, 0));
        chain.set_head(104);
        w.poll_once().await.unwrap();
        assert!(store.is_empty());

        chain.set_head(105);
        w.poll_once().await.unwrap();
        let tasks = store.all_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, Status::Pending);
        assert_eq!(tasks[0].source_confirmations, 5);
        assert_eq!(tasks[0].signature_count(), 1);
        assert_eq!(w.state(), WatcherState::Idle);
    }

    #[tokio::test]
    async fn test_range_is_clamped_and_cursor_advances() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(1));
        let mut s = settings(EventKind::SignatureRequest, 0);
        s.max_block_range = 10;
        let w = watcher(s, chain.clone(), store.clone(), 1);

        chain.set_head(25);
        assert_eq!(
            w.poll_once().await.unwrap(),
            PollOutcome::Processed {
                head: 25,
                from: 0,
                to: 9,
                inserted: 0,
                duplicates: 0,
                caught_up: false
            }
        );
        w.poll_once().await.unwrap();
        assert_eq!(
            w.poll_once().await.unwrap(),
            PollOutcome::Processed {
                head: 25,
                from: 20,
                to: 25,
                inserted: 0,
                duplicates: 0,
                caught_up: true
            }
        );
        assert_eq!(
            w.poll_once().await.unwrap(),
            PollOutcome::UpToDate { head: 25 }
        );
    }

    #[tokio::test]
    async fn test_multi_validator_tasks_await_quorum() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(2));
        let w = watcher(
            settings(EventKind::SignatureRequest, 0),
            chain.clone(),
            store.clone(),
            2,
        );
        chain.push_log(request_log(3, 0));
        chain.set_head(3);
        w.poll_once().await.unwrap();

        let task = &store.all_tasks()[0];
        assert_eq!(task.status, Status::AwaitingQuorum);
        assert_eq!(task.signature_count(), 1);
    }

    #[tokio::test]
    async fn test_second_validator_cosigns_shared_range() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(2));
        let first = watcher(
            settings(EventKind::SignatureRequest, 2),
            chain.clone(),
            store.clone(),
            2,
        );
        let second = watcher(
            settings(EventKind::SignatureRequest, 2),
            chain.clone(),
            store.clone(),
            2,
        );
        chain.push_log(request_log(5, 0));
        chain.set_head(7);

        first.poll_once().await.unwrap();
        assert_eq!(store.all_tasks()[0].status, Status::AwaitingQuorum);

        assert_eq!(
            second.poll_once().await.unwrap(),
            PollOutcome::UpToDate { head: 7 }
        );
        let task = &store.all_tasks()[0];
        assert_eq!(task.signature_count(), 2);
        assert_eq!(task.status, Status::ReadyToSend);
    }

    #[tokio::test]
    async fn test_cosigning_refuses_payload_missing_from_chain() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(2));
        let w = watcher(
            settings(EventKind::SignatureRequest, 0),
            chain.clone(),
            store.clone(),
            2,
        );
        chain.push_log(request_log(5, 0));
        chain.set_head(5);

        // Recorded by someone else with a value the chain never emitted
        let forged = RelayTask::new(
            Fingerprint::new(1, B256::repeat_byte(5), 0),
            FOREIGN,
            RelayPayload::SignatureRequest {
                recipient: Address::repeat_byte(0xaa),
                value: U256::from(1_000_000u64),
            },
            5,
            0,
            Status::AwaitingQuorum,
        );
        store.upsert(&forged).await.unwrap();

        assert_eq!(w.cosign_pending(5).await.unwrap(), 0);
        assert_eq!(store.get(&forged.fingerprint).await.unwrap().unwrap().signature_count(), 0);
    }

    #[tokio::test]
    async fn test_cosigning_pages_past_newer_and_unverifiable_tasks() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(2));
        let w = watcher(
            settings(EventKind::SignatureRequest, 0),
            chain.clone(),
            store.clone(),
            2,
        );

        // Older tasks this node cannot confirm fill more than one page
        for n in 1..=120u8 {
            let forged = RelayTask::new(
                Fingerprint::new(1, B256::with_last_byte(n), 0),
                FOREIGN,
                RelayPayload::SignatureRequest {
                    recipient: Address::repeat_byte(0xaa),
                    value: U256::from(n),
                },
                n as u64,
                0,
                Status::AwaitingQuorum,
            );
            store.upsert(&forged).await.unwrap();
        }

        chain.push_log(request_log(200, 0));
        let mut eligible = RelayTask::new(
            Fingerprint::new(1, B256::repeat_byte(200), 0),
            FOREIGN,
            RelayPayload::SignatureRequest {
                recipient: Address::repeat_byte(0xaa),
                value: U256::from(10u64),
            },
            200,
            0,
            Status::AwaitingQuorum,
        );
        let other = "0x00000000000000000000000000000000000000ff".to_string();
        eligible.signatures.insert(other, Bytes::from(vec![1u8; 65]));
        store.upsert(&eligible).await.unwrap();

        // Newer work of another event type on the same chain
        for n in 0..100u64 {
            let affirmation = RelayTask::new(
                Fingerprint::new(1, B256::left_padding_from(&(1_000 + n).to_be_bytes()), 0),
                FOREIGN,
                RelayPayload::AffirmationRequest {
                    recipient: Address::repeat_byte(0xbb),
                    value: U256::from(n),
                },
                300 + n,
                0,
                Status::AwaitingQuorum,
            );
            store.upsert(&affirmation).await.unwrap();
        }

        assert_eq!(w.cosign_pending(400).await.unwrap(), 1);
        let task = store.get(&eligible.fingerprint).await.unwrap().unwrap();
        assert_eq!(task.status, Status::ReadyToSend);
        assert_eq!(task.signature_count(), 2);
    }

    #[tokio::test]
    async fn test_absurd_collected_signature_count_is_skipped() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(1));
        let signer = PrivateKeySigner::random();
        let authority = signer.address();
        let set = [authority, Address::repeat_byte(0x21), Address::repeat_byte(0x22)];
        let aggregator = Arc::new(SignatureAggregator::new(signer, 2, set, HashMap::new()));
        let w = EventWatcher::new(
            settings(EventKind::CollectedSignatures, 0),
            chain.clone(),
            store.clone(),
            aggregator,
        );

        let count = U256::from(1_000_000_000u64);
        let data = (authority, B256::repeat_byte(0x44), count).abi_encode_params();
        chain.push_log(log_for(EventKind::CollectedSignatures, vec![], data, 3, 0));
        chain.set_head(3);

        // No eth_call responses are scripted, so any fetch would fail the poll
        w.poll_once().await.unwrap();
        assert!(store.is_empty());
        let cursor = store
            .load_cursor(1, EventKind::CollectedSignatures)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.last_processed_block, 3);
    }

    #[tokio::test]
    async fn test_collected_signatures_are_fetched_for_own_authority() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(1));
        let signer = PrivateKeySigner::random();
        let authority = signer.address();
        let aggregator = Arc::new(SignatureAggregator::new(signer, 1, Vec::new(), HashMap::new()));
        let w = EventWatcher::new(
            settings(EventKind::CollectedSignatures, 0),
            chain.clone(),
            store.clone(),
            aggregator,
        );

        let message_hash = B256::repeat_byte(0x33);
        let message = Bytes::from(vec![7u8; 104]);
        let signatures = [Bytes::from(vec![1u8; 65]), Bytes::from(vec![2u8; 65])];

        let contract = Address::repeat_byte(0x0c);
        chain.set_call_response(
            contract,
            HomeBridge::messageCall { hash: message_hash }.abi_encode().into(),
            (message.clone(),).abi_encode_params().into(),
        );
        for (index, signature) in signatures.iter().enumerate() {
            let call = HomeBridge::signatureCall {
                hash: message_hash,
                index: U256::from(index),
            };
            chain.set_call_response(
                contract,
                call.abi_encode().into(),
                (signature.clone(),).abi_encode_params().into(),
            );
        }

        let ours = (authority, message_hash, U256::from(2u64)).abi_encode_params();
        let theirs = (Address::repeat_byte(0x99), message_hash, U256::from(2u64)).abi_encode_params();
        chain.push_log(log_for(EventKind::CollectedSignatures, vec![], ours, 3, 0));
        chain.push_log(log_for(EventKind::CollectedSignatures, vec![], theirs, 3, 1));
        chain.set_head(3);

        w.poll_once().await.unwrap();
        let tasks = store.all_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, Status::ReadyToSend);
        assert_eq!(tasks[0].signature_count(), 0);
        match &tasks[0].payload {
            RelayPayload::CollectedSignatures {
                message: fetched,
                signatures: collected,
                ..
            } => {
                assert_eq!(fetched, &message);
                assert_eq!(collected.as_slice(), &signatures[..]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_transfers_are_skipped() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(1));
        let w = watcher(settings(EventKind::Transfer, 0), chain.clone(), store.clone(), 1);

        let to_bridge = log_for(
            EventKind::Transfer,
            vec![Address::repeat_byte(1).into_word(), Address::repeat_byte(0x0b).into_word()],
            U256::from(5u64).abi_encode(),
            1,
            0,
        );
        let elsewhere = log_for(
            EventKind::Transfer,
            vec![Address::repeat_byte(1).into_word(), Address::repeat_byte(0x0d).into_word()],
            U256::from(5u64).abi_encode(),
            1,
            1,
        );
        let truncated = log_for(EventKind::Transfer, vec![], vec![1, 2, 3], 1, 2);
        chain.push_log(to_bridge);
        chain.push_log(elsewhere);
        chain.push_log(truncated);
        chain.set_head(1);

        w.poll_once().await.unwrap();
        let tasks = store.all_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].fingerprint.log_index, 0);
    }

    #[tokio::test]
    async fn test_rpc_failure_leaves_cursor_untouched() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(1));
        let w = watcher(
            settings(EventKind::SignatureRequest, 0),
            chain.clone(),
            store.clone(),
            1,
        );
        chain.set_head(10);
        chain.fail_next_get_logs(RpcError::Unavailable("connection reset".into()));

        assert!(w.poll_once().await.is_err());
        assert!(store
            .load_cursor(1, EventKind::SignatureRequest)
            .await
            .unwrap()
            .is_none());
        assert_eq!(w.state(), WatcherState::Idle);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let chain = Arc::new(MockChain::new(1));
        let store = Arc::new(MemoryTaskStore::new(1));
        let w = watcher(settings(EventKind::SignatureRequest, 0), chain, store, 1);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
