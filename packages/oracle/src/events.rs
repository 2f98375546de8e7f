//! Relay payloads and log decoding
//!
//! Every watched event has a fixed schema. Logs are decoded into a tagged
//! [`RelayPayload`] and validated at decode time; anything else is a
//! [`DecodeError`].

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolEvent;
use serde::{Deserialize, Serialize};

use crate::chain::LogEntry;
use crate::contracts::{BridgeableToken, ForeignBridge, HomeBridge};
use crate::error::DecodeError;
use crate::types::EventKind;

/// Decoded event arguments, one variant per event type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayPayload {
    SignatureRequest {
        recipient: Address,
        value: U256,
    },
    CollectedSignatures {
        authority: Address,
        message_hash: B256,
        signature_count: u64,
        /// Filled in by the watcher from the home bridge
        #[serde(default)]
        message: Bytes,
        /// Filled in by the watcher from the home bridge
        #[serde(default)]
        signatures: Vec<Bytes>,
    },
    AffirmationRequest {
        recipient: Address,
        value: U256,
    },
    Transfer {
        from: Address,
        to: Address,
        value: U256,
    },
}

impl RelayPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            RelayPayload::SignatureRequest { .. } => EventKind::SignatureRequest,
            RelayPayload::CollectedSignatures { .. } => EventKind::CollectedSignatures,
            RelayPayload::AffirmationRequest { .. } => EventKind::AffirmationRequest,
            RelayPayload::Transfer { .. } => EventKind::Transfer,
        }
    }

    /// Who receives tokens on the destination chain and how many
    ///
    /// A transfer into the bridge is paid back out to its sender.
    pub fn recipient_and_value(&self) -> Option<(Address, U256)> {
        match self {
            RelayPayload::SignatureRequest { recipient, value }
            | RelayPayload::AffirmationRequest { recipient, value } => Some((*recipient, *value)),
            RelayPayload::Transfer { from, value, .. } => Some((*from, *value)),
            RelayPayload::CollectedSignatures { .. } => None,
        }
    }
}

/// Topic0 of the event a kind is decoded from
pub fn event_signature(kind: EventKind) -> B256 {
    match kind {
        EventKind::SignatureRequest => HomeBridge::UserRequestForSignature::SIGNATURE_HASH,
        EventKind::CollectedSignatures => HomeBridge::CollectedSignatures::SIGNATURE_HASH,
        EventKind::AffirmationRequest => ForeignBridge::UserRequestForAffirmation::SIGNATURE_HASH,
        EventKind::Transfer => BridgeableToken::Transfer::SIGNATURE_HASH,
    }
}

/// Where a decoded log sits on its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLocation {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl LogLocation {
    pub fn of(log: &LogEntry) -> Result<Self, DecodeError> {
        Ok(Self {
            block_number: log
                .block_number
                .ok_or(DecodeError::MissingField("block number"))?,
            tx_hash: log
                .transaction_hash
                .ok_or(DecodeError::MissingField("transaction hash"))?,
            log_index: log.log_index.ok_or(DecodeError::MissingField("log index"))?,
        })
    }
}

/// Decode a log of the given kind
pub fn decode_log(kind: EventKind, log: &LogEntry) -> Result<RelayPayload, DecodeError> {
    let topic0 = log
        .topics
        .first()
        .ok_or(DecodeError::MissingField("event signature topic"))?;
    if *topic0 != event_signature(kind) {
        return Err(DecodeError::UnknownEvent {
            expected: kind,
            topic: topic0.to_string(),
        });
    }

    let topics = log.topics.iter().copied();
    let data = log.data.as_ref();
    let malformed = |e: alloy::sol_types::Error| DecodeError::Malformed {
        kind,
        reason: e.to_string(),
    };

    let payload = match kind {
        EventKind::SignatureRequest => {
            let event = HomeBridge::UserRequestForSignature::decode_raw_log(topics, data, true)
                .map_err(malformed)?;
            RelayPayload::SignatureRequest {
                recipient: event.recipient,
                value: event.value,
            }
        }
        EventKind::CollectedSignatures => {
            let event = HomeBridge::CollectedSignatures::decode_raw_log(topics, data, true)
                .map_err(malformed)?;
            let signature_count: u64 =
                event
                    .NumberOfCollectedSignatures
                    .try_into()
                    .map_err(|_| DecodeError::Malformed {
                        kind,
                        reason: "signature count does not fit in u64".to_string(),
                    })?;
            RelayPayload::CollectedSignatures {
                authority: event.authorityResponsibleForRelay,
                message_hash: event.messageHash,
                signature_count,
                message: Bytes::new(),
                signatures: Vec::new(),
            }
        }
        EventKind::AffirmationRequest => {
            let event = ForeignBridge::UserRequestForAffirmation::decode_raw_log(topics, data, true)
                .map_err(malformed)?;
            RelayPayload::AffirmationRequest {
                recipient: event.recipient,
                value: event.value,
            }
        }
        EventKind::Transfer => {
            let event =
                BridgeableToken::Transfer::decode_raw_log(topics, data, true).map_err(malformed)?;
            RelayPayload::Transfer {
                from: event.from,
                to: event.to,
                value: event.value,
            }
        }
    };

    if payload.recipient_and_value().is_some_and(|(_, value)| value.is_zero()) {
        return Err(DecodeError::Malformed {
            kind,
            reason: "zero value".to_string(),
        });
    }

    Ok(payload)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy::primitives::{address, b256};
    use alloy::sol_types::SolValue;

    /// Build a log as a node would return it
    pub(crate) fn log_for(
        kind: EventKind,
        topics: Vec<B256>,
        data: Vec<u8>,
        block: u64,
        log_index: u64,
    ) -> LogEntry {
        let mut all_topics = vec![event_signature(kind)];
        all_topics.extend(topics);
        LogEntry {
            address: Address::ZERO,
            topics: all_topics,
            data: data.into(),
            block_number: Some(block),
            transaction_hash: Some(B256::repeat_byte(block as u8)),
            log_index: Some(log_index),
        }
    }

    #[test]
    fn test_decode_signature_request() {
        let recipient = address!("00000000000000000000000000000000000000a1");
        let data = (recipient, U256::from(500u64)).abi_encode_params();
        let log = log_for(EventKind::SignatureRequest, vec![], data, 10, 0);

        let payload = decode_log(EventKind::SignatureRequest, &log).unwrap();
        assert_eq!(
            payload,
            RelayPayload::SignatureRequest {
                recipient,
                value: U256::from(500u64)
            }
        );
        assert_eq!(payload.kind(), EventKind::SignatureRequest);
    }

    #[test]
    fn test_decode_transfer_uses_indexed_topics() {
        let from = address!("00000000000000000000000000000000000000f1");
        let to = address!("00000000000000000000000000000000000000b2");
        let log = log_for(
            EventKind::Transfer,
            vec![from.into_word(), to.into_word()],
            U256::from(7u64).abi_encode(),
            5,
            2,
        );

        let payload = decode_log(EventKind::Transfer, &log).unwrap();
        assert_eq!(payload.recipient_and_value(), Some((from, U256::from(7u64))));
        match payload {
            RelayPayload::Transfer { to: decoded_to, .. } => assert_eq!(decoded_to, to),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_collected_signatures() {
        let authority = address!("00000000000000000000000000000000000000c3");
        let hash = b256!("4444444444444444444444444444444444444444444444444444444444444444");
        let data = (authority, hash, U256::from(2u64)).abi_encode_params();
        let log = log_for(EventKind::CollectedSignatures, vec![], data, 1, 0);

        match decode_log(EventKind::CollectedSignatures, &log).unwrap() {
            RelayPayload::CollectedSignatures {
                authority: a,
                message_hash,
                signature_count,
                message,
                signatures,
            } => {
                assert_eq!(a, authority);
                assert_eq!(message_hash, hash);
                assert_eq!(signature_count, 2);
                assert!(message.is_empty());
                assert!(signatures.is_empty());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_wrong_topic_is_unknown_event() {
        let data = (Address::ZERO, U256::from(1u64)).abi_encode_params();
        let log = log_for(EventKind::SignatureRequest, vec![], data, 1, 0);
        let err = decode_log(EventKind::AffirmationRequest, &log).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownEvent { .. }));
    }

    #[test]
    fn test_truncated_data_is_malformed() {
        let log = log_for(EventKind::AffirmationRequest, vec![], vec![0u8; 20], 1, 0);
        let err = decode_log(EventKind::AffirmationRequest, &log).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_zero_value_is_rejected() {
        let data = (Address::repeat_byte(1), U256::ZERO).abi_encode_params();
        let log = log_for(EventKind::AffirmationRequest, vec![], data, 1, 0);
        assert!(matches!(
            decode_log(EventKind::AffirmationRequest, &log),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_missing_location_fields() {
        let data = (Address::repeat_byte(1), U256::from(1u64)).abi_encode_params();
        let mut log = log_for(EventKind::AffirmationRequest, vec![], data, 1, 0);
        log.transaction_hash = None;
        assert_eq!(
            LogLocation::of(&log),
            Err(DecodeError::MissingField("transaction hash"))
        );
    }

    #[test]
    fn test_payload_serializes_with_event_tag() {
        let payload = RelayPayload::AffirmationRequest {
            recipient: Address::repeat_byte(0x11),
            value: U256::from(9u64),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event"], "affirmation_request");
        let back: RelayPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
