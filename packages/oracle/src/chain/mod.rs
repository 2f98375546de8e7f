//! Chain client abstraction
//!
//! Watchers and senders only ever talk to a chain through [`ChainClient`], so
//! the JSON-RPC transport can be swapped for the scripted mock in tests.

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

pub mod rpc;

pub use rpc::JsonRpcClient;

/// A contract log as returned by `eth_getLogs`
///
/// Location fields are optional because nodes return `null` for logs of
/// pending blocks; the decoder rejects those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
}

/// The parts of a transaction receipt the sender cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    /// `true` when the transaction executed without reverting
    pub success: bool,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Numeric chain id this client is bound to
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> Result<u64, RpcError>;

    /// Logs emitted by `address` whose first topic is `event_signature`,
    /// in the inclusive block range
    async fn get_logs(
        &self,
        address: Address,
        event_signature: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, RpcError>;

    async fn send_raw_transaction(&self, signed_tx: Bytes) -> Result<B256, RpcError>;

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, RpcError>;

    /// Next usable nonce for `address`, counting pending transactions
    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError>;

    async fn gas_price(&self) -> Result<u128, RpcError>;

    /// Read-only contract call against the latest block
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError>;

    /// Blocks mined on top of the transaction's block, or `None` if it has
    /// no receipt yet
    async fn confirmations(&self, tx_hash: B256) -> Result<Option<u64>, RpcError> {
        let Some(receipt) = self.transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        let head = self.block_number().await?;
        Ok(Some(head.saturating_sub(receipt.block_number)))
    }
}
