//! Core relay types shared by watchers, the task store and senders.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Bytes, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::RelayPayload;

/// Which side of the bridge a chain sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSide {
    Home,
    Foreign,
}

impl ChainSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainSide::Home => "home",
            ChainSide::Foreign => "foreign",
        }
    }

    pub fn opposite(&self) -> ChainSide {
        match self {
            ChainSide::Home => ChainSide::Foreign,
            ChainSide::Foreign => ChainSide::Home,
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bridge event types that produce relay tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `UserRequestForSignature` on the home bridge
    SignatureRequest,
    /// `CollectedSignatures` on the home bridge
    CollectedSignatures,
    /// `UserRequestForAffirmation` on the foreign bridge
    AffirmationRequest,
    /// ERC20 `Transfer` into the foreign bridge
    Transfer,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::SignatureRequest,
        EventKind::CollectedSignatures,
        EventKind::AffirmationRequest,
        EventKind::Transfer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SignatureRequest => "signature_request",
            EventKind::CollectedSignatures => "collected_signatures",
            EventKind::AffirmationRequest => "affirmation_request",
            EventKind::Transfer => "transfer",
        }
    }

    /// Whether validators sign this task off-chain before it can be sent.
    ///
    /// Collected signatures were already aggregated by the home bridge.
    pub fn requires_validator_signature(&self) -> bool {
        !matches!(self, EventKind::CollectedSignatures)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

/// Unknown role, status or event name
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown name: {0}")]
pub struct UnknownName(pub String);

/// Deterministic identity of a relay task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    pub chain_id: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl Fingerprint {
    pub fn new(chain_id: u64, tx_hash: B256, log_index: u64) -> Self {
        Self {
            chain_id,
            tx_hash,
            log_index,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.tx_hash, self.log_index)
    }
}

/// Processing status of a relay task
///
/// The variant order is the lifecycle order; a task never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    AwaitingQuorum,
    ReadyToSend,
    Claimed,
    Sent,
    Confirmed,
    Failed,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Pending,
        Status::AwaitingQuorum,
        Status::ReadyToSend,
        Status::Claimed,
        Status::Sent,
        Status::Confirmed,
        Status::Failed,
    ];

    /// Get the status as a snake_case string
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::AwaitingQuorum => "awaiting_quorum",
            Status::ReadyToSend => "ready_to_send",
            Status::Claimed => "claimed",
            Status::Sent => "sent",
            Status::Confirmed => "confirmed",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Confirmed | Status::Failed)
    }

    /// Statuses a sender may claim from
    pub fn is_claimable(&self) -> bool {
        matches!(self, Status::Pending | Status::ReadyToSend)
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (Confirmed | Failed, _) => false,
            (_, Failed) => true,
            (Pending, Claimed) => true,
            (AwaitingQuorum, ReadyToSend) => true,
            (ReadyToSend, Claimed) => true,
            (Claimed, Sent) => true,
            (Sent, Sent) => true,
            (Sent, Confirmed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

/// One validator's signature over a task's relay message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSignature {
    pub validator_id: String,
    pub fingerprint: Fingerprint,
    pub signature: Bytes,
}

/// Last block a watcher has fully recorded, per (chain, event type)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    pub chain_id: u64,
    pub event_type: EventKind,
    pub last_processed_block: u64,
}

/// A cross-chain message waiting to be (or already) relayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTask {
    pub fingerprint: Fingerprint,
    pub event_type: EventKind,
    pub destination_chain_id: u64,
    pub payload: RelayPayload,
    pub source_block: u64,
    pub source_confirmations: u64,
    pub status: Status,
    /// Last transaction signed for this task; recorded before broadcast while
    /// the task is Claimed
    pub destination_tx_hash: Option<B256>,
    pub destination_nonce: Option<u64>,
    /// Keyed by validator id, so each validator appears once
    pub signatures: BTreeMap<String, Bytes>,
    pub claimed_by: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    /// Node rejections across all submission rounds
    pub rejection_count: u32,
}

impl RelayTask {
    pub fn new(
        fingerprint: Fingerprint,
        destination_chain_id: u64,
        payload: RelayPayload,
        source_block: u64,
        source_confirmations: u64,
        status: Status,
    ) -> Self {
        Self {
            fingerprint,
            event_type: payload.kind(),
            destination_chain_id,
            payload,
            source_block,
            source_confirmations,
            status,
            destination_tx_hash: None,
            destination_nonce: None,
            signatures: BTreeMap::new(),
            claimed_by: None,
            error_message: None,
            created_at: Utc::now(),
            last_attempt_at: None,
            attempt_count: 0,
            rejection_count: 0,
        }
    }

    pub fn add_signature(&mut self, signature: ValidatorSignature) {
        self.signatures
            .entry(signature.validator_id)
            .or_insert(signature.signature);
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}

/// Watcher worker names from the process-manager configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherRole {
    SignatureRequest,
    CollectedSignatures,
    AffirmationRequest,
    Transfer,
}

impl WatcherRole {
    pub const ALL: [WatcherRole; 4] = [
        WatcherRole::SignatureRequest,
        WatcherRole::CollectedSignatures,
        WatcherRole::AffirmationRequest,
        WatcherRole::Transfer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WatcherRole::SignatureRequest => "signature-request-watcher",
            WatcherRole::CollectedSignatures => "collected-signatures-watcher",
            WatcherRole::AffirmationRequest => "affirmation-request-watcher",
            WatcherRole::Transfer => "transfer-watcher",
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            WatcherRole::SignatureRequest => EventKind::SignatureRequest,
            WatcherRole::CollectedSignatures => EventKind::CollectedSignatures,
            WatcherRole::AffirmationRequest => EventKind::AffirmationRequest,
            WatcherRole::Transfer => EventKind::Transfer,
        }
    }

    /// Chain the watched events are emitted on
    pub fn source(&self) -> ChainSide {
        match self {
            WatcherRole::SignatureRequest | WatcherRole::CollectedSignatures => ChainSide::Home,
            WatcherRole::AffirmationRequest | WatcherRole::Transfer => ChainSide::Foreign,
        }
    }

    pub fn destination(&self) -> ChainSide {
        self.source().opposite()
    }

    /// Offset from `API_PORT` of this worker's HTTP server
    pub fn api_port_offset(&self) -> u16 {
        match self {
            WatcherRole::SignatureRequest => 0,
            WatcherRole::CollectedSignatures => 1,
            WatcherRole::AffirmationRequest => 2,
            WatcherRole::Transfer => 3,
        }
    }
}

impl fmt::Display for WatcherRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for WatcherRole {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WatcherRole::ALL
            .into_iter()
            .find(|role| role.name() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

/// Sender worker names from the process-manager configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderRole {
    Home,
    Foreign,
}

impl SenderRole {
    pub fn name(&self) -> &'static str {
        match self {
            SenderRole::Home => "home-sender",
            SenderRole::Foreign => "foreign-sender",
        }
    }

    pub fn side(&self) -> ChainSide {
        match self {
            SenderRole::Home => ChainSide::Home,
            SenderRole::Foreign => ChainSide::Foreign,
        }
    }

    /// Senders follow the four watchers
    pub fn api_port_offset(&self) -> u16 {
        match self {
            SenderRole::Home => 4,
            SenderRole::Foreign => 5,
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SenderRole {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home-sender" => Ok(SenderRole::Home),
            "foreign-sender" => Ok(SenderRole::Foreign),
            other => Err(UnknownName(other.to_string())),
        }
    }
}
