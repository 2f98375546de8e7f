//! JSON-RPC chain client over HTTP
//!
//! Speaks the small `eth_*` subset the oracle needs directly with reqwest, so
//! transport failures and node rejections map cleanly onto [`RpcError`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U128, U64};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::trace;

use super::{ChainClient, LogEntry, Receipt};
use crate::error::RpcError;

/// JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

/// JSON-RPC error object
#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Log as serialized by the node (hex quantities)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<U64>,
    transaction_hash: Option<B256>,
    log_index: Option<U64>,
}

impl From<RpcLog> for LogEntry {
    fn from(log: RpcLog) -> Self {
        LogEntry {
            address: log.address,
            topics: log.topics,
            data: log.data,
            block_number: log.block_number.map(|n| n.to::<u64>()),
            transaction_hash: log.transaction_hash,
            log_index: log.log_index.map(|n| n.to::<u64>()),
        }
    }
}

/// Transaction receipt as serialized by the node
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: Option<U64>,
    status: Option<U64>,
}

/// HTTP JSON-RPC client bound to one chain
pub struct JsonRpcClient {
    url: String,
    chain_id: u64,
    client: Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    /// Create a client; `timeout` bounds every individual call
    pub fn new(url: &str, chain_id: u64, timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            chain_id,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call a method whose result may legitimately be `null`
    async fn request_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        trace!(method, id, url = %self.url, "JSON-RPC request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Unavailable(format!("{}: {}", method, e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(RpcError::Unavailable(format!(
                "{}: HTTP {}",
                method, status
            )));
        }

        let response = response
            .json::<RpcResponse<T>>()
            .await
            .map_err(|e| RpcError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(error) = response.error {
            return Err(RpcError::Rejected {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result)
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        self.request_optional(method, params)
            .await?
            .ok_or_else(|| RpcError::InvalidResponse(format!("{}: null result", method)))
    }
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let block: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(block.to::<u64>())
    }

    async fn get_logs(
        &self,
        address: Address,
        event_signature: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, RpcError> {
        let filter = json!({
            "address": address,
            "topics": [event_signature],
            "fromBlock": U64::from(from_block),
            "toBlock": U64::from(to_block),
        });
        let logs: Vec<RpcLog> = self.request("eth_getLogs", json!([filter])).await?;
        Ok(logs.into_iter().map(LogEntry::from).collect())
    }

    async fn send_raw_transaction(&self, signed_tx: Bytes) -> Result<B256, RpcError> {
        self.request("eth_sendRawTransaction", json!([signed_tx]))
            .await
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, RpcError> {
        let receipt: Option<RpcReceipt> = self
            .request_optional("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;

        // A receipt without a block number belongs to a pending block
        Ok(receipt.and_then(|r| {
            r.block_number.map(|block| Receipt {
                transaction_hash: r.transaction_hash,
                block_number: block.to::<u64>(),
                success: r.status.map(|s| s == U64::from(1)).unwrap_or(false),
            })
        }))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        let count: U64 = self
            .request("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        Ok(count.to::<u64>())
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        let price: U128 = self.request("eth_gasPrice", json!([])).await?;
        Ok(price.to::<u128>())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError> {
        let tx = json!({ "to": to, "data": data });
        self.request("eth_call", json!([tx, "latest"])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_deserializes_hex_quantities() {
        let raw = json!({
            "address": "0x00000000000000000000000000000000000000aa",
            "topics": ["0x1111111111111111111111111111111111111111111111111111111111111111"],
            "data": "0x01",
            "blockNumber": "0x64",
            "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "logIndex": "0x3",
            "removed": false
        });
        let log: LogEntry = serde_json::from_value::<RpcLog>(raw).unwrap().into();
        assert_eq!(log.block_number, Some(100));
        assert_eq!(log.log_index, Some(3));
        assert_eq!(log.data.as_ref(), &[1u8]);
    }

    #[test]
    fn test_pending_log_has_no_location() {
        let raw = json!({
            "address": "0x00000000000000000000000000000000000000aa",
            "topics": [],
            "data": "0x",
            "blockNumber": null,
            "transactionHash": null,
            "logIndex": null
        });
        let log: LogEntry = serde_json::from_value::<RpcLog>(raw).unwrap().into();
        assert_eq!(log.block_number, None);
        assert_eq!(log.transaction_hash, None);
    }

    #[test]
    fn test_error_object_deserializes() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "nonce too low" }
        });
        let response: RpcResponse<B256> = serde_json::from_value(raw).unwrap();
        assert!(response.result.is_none());
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "nonce too low");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_unavailable() {
        let client =
            JsonRpcClient::new("http://127.0.0.1:1", 1, Duration::from_millis(500)).unwrap();
        let err = client.block_number().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {}", err);
    }
}
