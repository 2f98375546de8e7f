//! Scripted chain client for tests and local dry runs
//!
//! [`MockChain`] keeps a fake chain in memory: a head block, a log set, mined
//! receipts and a queue of errors to return from `send_raw_transaction`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{keccak256, Address, Bytes, B256};
use async_trait::async_trait;

use crate::chain::{ChainClient, LogEntry, Receipt};
use crate::error::RpcError;
use crate::sender::retry::RetryConfig;

/// Retry settings with millisecond backoffs
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..RetryConfig::default()
    }
}

#[derive(Default)]
struct State {
    head: u64,
    logs: Vec<LogEntry>,
    receipts: HashMap<B256, Receipt>,
    send_errors: VecDeque<RpcError>,
    get_logs_error: Option<RpcError>,
    sent: Vec<Bytes>,
    transaction_count: u64,
    gas_price: u128,
    calls: HashMap<(Address, Bytes), Bytes>,
}

pub struct MockChain {
    chain_id: u64,
    state: Mutex<State>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(State {
                gas_price: 1_000_000_000,
                ..State::default()
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_head(&self, head: u64) {
        self.with_state(|s| s.head = head);
    }

    pub fn push_log(&self, log: LogEntry) {
        self.with_state(|s| s.logs.push(log));
    }

    /// Queue an error for the next `send_raw_transaction`
    pub fn script_send_error(&self, error: RpcError) {
        self.with_state(|s| s.send_errors.push_back(error));
    }

    pub fn fail_next_get_logs(&self, error: RpcError) {
        self.with_state(|s| s.get_logs_error = Some(error));
    }

    /// Give a transaction a receipt at `block`
    pub fn mine(&self, tx_hash: B256, block: u64, success: bool) {
        self.with_state(|s| {
            s.receipts.insert(
                tx_hash,
                Receipt {
                    transaction_hash: tx_hash,
                    block_number: block,
                    success,
                },
            );
        });
    }

    pub fn set_transaction_count(&self, count: u64) {
        self.with_state(|s| s.transaction_count = count);
    }

    pub fn set_gas_price(&self, gas_price: u128) {
        self.with_state(|s| s.gas_price = gas_price);
    }

    /// Answer `eth_call` to `to` with `data` by returning `result`
    pub fn set_call_response(&self, to: Address, data: Bytes, result: Bytes) {
        self.with_state(|s| {
            s.calls.insert((to, data), result);
        });
    }

    /// Raw transactions the mock accepted, in order
    pub fn sent_transactions(&self) -> Vec<Bytes> {
        self.with_state(|s| s.sent.clone())
    }

    fn decoded(&self) -> Vec<TxEnvelope> {
        self.sent_transactions()
            .iter()
            .filter_map(|raw| TxEnvelope::decode_2718(&mut raw.as_ref()).ok())
            .collect()
    }

    pub fn sent_nonces(&self) -> Vec<u64> {
        self.decoded().iter().map(|tx| tx.nonce()).collect()
    }

    pub fn sent_gas_prices(&self) -> Vec<u128> {
        self.decoded()
            .iter()
            .filter_map(|tx| tx.gas_price())
            .collect()
    }

    /// Decoded calldata of every accepted transaction
    pub fn sent_inputs(&self) -> Vec<Bytes> {
        self.decoded().iter().map(|tx| tx.input().clone()).collect()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.with_state(|s| s.head))
    }

    async fn get_logs(
        &self,
        _address: Address,
        event_signature: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, RpcError> {
        self.with_state(|s| {
            if let Some(error) = s.get_logs_error.take() {
                return Err(error);
            }
            Ok(s.logs
                .iter()
                .filter(|log| log.topics.first() == Some(&event_signature))
                .filter(|log| {
                    log.block_number
                        .map_or(true, |block| (from_block..=to_block).contains(&block))
                })
                .cloned()
                .collect())
        })
    }

    async fn send_raw_transaction(&self, signed_tx: Bytes) -> Result<B256, RpcError> {
        self.with_state(|s| {
            if let Some(error) = s.send_errors.pop_front() {
                return Err(error);
            }
            if let Ok(tx) = TxEnvelope::decode_2718(&mut signed_tx.as_ref()) {
                s.transaction_count = s.transaction_count.max(tx.nonce() + 1);
            }
            let hash = keccak256(&signed_tx);
            s.sent.push(signed_tx);
            Ok(hash)
        })
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, RpcError> {
        Ok(self.with_state(|s| s.receipts.get(&tx_hash).copied()))
    }

    async fn transaction_count(&self, _address: Address) -> Result<u64, RpcError> {
        Ok(self.with_state(|s| s.transaction_count))
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        Ok(self.with_state(|s| s.gas_price))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError> {
        self.with_state(|s| {
            s.calls
                .get(&(to, data))
                .cloned()
                .ok_or_else(|| RpcError::Rejected {
                    code: 3,
                    message: "execution reverted".to_string(),
                })
        })
    }
}
