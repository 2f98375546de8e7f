//! Row types for the relay tables and their conversion into domain types

use std::collections::BTreeMap;
use std::str::FromStr;

use alloy::primitives::{Bytes, B256};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::StoreError;
use crate::events::RelayPayload;
use crate::types::{ChainCursor, EventKind, Fingerprint, RelayTask, Status};

// Chain ids, block numbers and log indices are BIGINT; hashes are stored as
// lowercase 0x hex so they stay readable in psql.

/// A row of `relay_tasks`
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub source_chain_id: i64,
    pub source_tx_hash: String,
    pub log_index: i64,
    pub event_type: String,
    pub destination_chain_id: i64,
    pub payload: serde_json::Value,
    pub source_block: i64,
    pub source_confirmations: i64,
    pub status: String,
    pub destination_tx_hash: Option<String>,
    pub destination_nonce: Option<i64>,
    pub claimed_by: Option<String>,
    pub error_message: Option<String>,
    pub attempt_count: i32,
    pub rejection_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// A row of `validator_signatures`
#[derive(Debug, Clone, FromRow)]
pub struct SignatureRow {
    pub validator_id: String,
    pub signature: Vec<u8>,
}

/// A row of `chain_cursors`
#[derive(Debug, Clone, FromRow)]
pub struct CursorRow {
    pub chain_id: i64,
    pub event_type: String,
    pub last_processed_block: i64,
}

/// Columns selected into a [`TaskRow`]
pub const TASK_COLUMNS: &str = "source_chain_id, source_tx_hash, log_index, event_type, \
    destination_chain_id, payload, source_block, source_confirmations, status, \
    destination_tx_hash, destination_nonce, claimed_by, error_message, attempt_count, \
    rejection_count, created_at, last_attempt_at";

fn unsigned(field: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", field, value)))
}

fn count(field: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", field, value)))
}

fn hash(field: &str, value: &str) -> Result<B256, StoreError> {
    B256::from_str(value).map_err(|e| StoreError::Corrupt(format!("{} {:?}: {}", field, value, e)))
}

/// Key columns of a fingerprint as bound into queries
pub fn fingerprint_key(fingerprint: &Fingerprint) -> (i64, String, i64) {
    (
        fingerprint.chain_id as i64,
        fingerprint.tx_hash.to_string(),
        fingerprint.log_index as i64,
    )
}

impl TaskRow {
    pub fn fingerprint(&self) -> Result<Fingerprint, StoreError> {
        Ok(Fingerprint::new(
            unsigned("source_chain_id", self.source_chain_id)?,
            hash("source_tx_hash", &self.source_tx_hash)?,
            unsigned("log_index", self.log_index)?,
        ))
    }

    /// Build the domain task; signatures are loaded separately
    pub fn into_task(self, signatures: Vec<SignatureRow>) -> Result<RelayTask, StoreError> {
        let fingerprint = self.fingerprint()?;
        let event_type = EventKind::from_str(&self.event_type)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let status =
            Status::from_str(&self.status).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let payload: RelayPayload = serde_json::from_value(self.payload)
            .map_err(|e| StoreError::Corrupt(format!("payload of {}: {}", fingerprint, e)))?;

        if payload.kind() != event_type {
            return Err(StoreError::Corrupt(format!(
                "task {} is {} but carries a {} payload",
                fingerprint,
                event_type,
                payload.kind()
            )));
        }

        let destination_tx_hash = self
            .destination_tx_hash
            .as_deref()
            .map(|h| hash("destination_tx_hash", h))
            .transpose()?;

        let signatures: BTreeMap<String, Bytes> = signatures
            .into_iter()
            .map(|row| (row.validator_id, Bytes::from(row.signature)))
            .collect();

        Ok(RelayTask {
            fingerprint,
            event_type,
            destination_chain_id: unsigned("destination_chain_id", self.destination_chain_id)?,
            payload,
            source_block: unsigned("source_block", self.source_block)?,
            source_confirmations: unsigned("source_confirmations", self.source_confirmations)?,
            status,
            destination_tx_hash,
            destination_nonce: self
                .destination_nonce
                .map(|n| unsigned("destination_nonce", n))
                .transpose()?,
            signatures,
            claimed_by: self.claimed_by,
            error_message: self.error_message,
            created_at: self.created_at,
            last_attempt_at: self.last_attempt_at,
            attempt_count: count("attempt_count", self.attempt_count)?,
            rejection_count: count("rejection_count", self.rejection_count)?,
        })
    }
}

impl TryFrom<CursorRow> for ChainCursor {
    type Error = StoreError;

    fn try_from(row: CursorRow) -> Result<Self, Self::Error> {
        Ok(ChainCursor {
            chain_id: unsigned("chain_id", row.chain_id)?,
            event_type: EventKind::from_str(&row.event_type)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            last_processed_block: unsigned("last_processed_block", row.last_processed_block)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};

    fn row() -> TaskRow {
        let payload = RelayPayload::AffirmationRequest {
            recipient: Address::repeat_byte(0x0a),
            value: U256::from(12u64),
        };
        TaskRow {
            source_chain_id: 77,
            source_tx_hash: B256::repeat_byte(0xcd).to_string(),
            log_index: 4,
            event_type: "affirmation_request".to_string(),
            destination_chain_id: 99,
            payload: serde_json::to_value(&payload).unwrap(),
            source_block: 1_000,
            source_confirmations: 12,
            status: "sent".to_string(),
            destination_tx_hash: Some(B256::repeat_byte(0x01).to_string()),
            destination_nonce: Some(17),
            claimed_by: Some("sender-a".to_string()),
            error_message: None,
            attempt_count: 2,
            rejection_count: 1,
            created_at: Utc::now(),
            last_attempt_at: None,
        }
    }

    #[test]
    fn test_row_into_task() {
        let task = row()
            .into_task(vec![SignatureRow {
                validator_id: "0xabc".to_string(),
                signature: vec![1, 2, 3],
            }])
            .unwrap();

        assert_eq!(task.fingerprint, Fingerprint::new(77, B256::repeat_byte(0xcd), 4));
        assert_eq!(task.status, Status::Sent);
        assert_eq!(task.event_type, EventKind::AffirmationRequest);
        assert_eq!(task.destination_tx_hash, Some(B256::repeat_byte(0x01)));
        assert_eq!(task.signatures["0xabc"].as_ref(), &[1, 2, 3]);
        assert_eq!(task.attempt_count, 2);
        assert_eq!(task.destination_nonce, Some(17));
        assert_eq!(task.rejection_count, 1);
    }

    #[test]
    fn test_fingerprint_key_matches_row_encoding() {
        let fp = Fingerprint::new(77, B256::repeat_byte(0xcd), 4);
        let (chain, hash, index) = fingerprint_key(&fp);
        assert_eq!(chain, 77);
        assert_eq!(hash, row().source_tx_hash);
        assert_eq!(index, 4);
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let mut bad = row();
        bad.status = "reorged".to_string();
        assert!(matches!(bad.into_task(vec![]), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_payload_kind_mismatch_is_corrupt() {
        let mut bad = row();
        bad.event_type = "transfer".to_string();
        assert!(matches!(bad.into_task(vec![]), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_negative_nonce_is_corrupt() {
        let mut bad = row();
        bad.destination_nonce = Some(-3);
        assert!(matches!(bad.into_task(vec![]), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_negative_cursor_is_corrupt() {
        let result = ChainCursor::try_from(CursorRow {
            chain_id: 1,
            event_type: "transfer".to_string(),
            last_processed_block: -1,
        });
        assert!(result.is_err());
    }
}
