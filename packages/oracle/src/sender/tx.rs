//! Destination calldata and raw transaction signing

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;

use crate::aggregator::{pack_signatures, SignatureAggregator};
use crate::contracts::{ForeignBridge, HomeBridge};
use crate::error::SignatureError;
use crate::events::RelayPayload;
use crate::types::RelayTask;

/// A signed legacy transaction ready for `eth_sendRawTransaction`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: B256,
    pub nonce: u64,
    pub gas_price: u128,
}

/// Sign an EIP-155 legacy transaction calling `to`
pub fn sign_legacy(
    signer: &PrivateKeySigner,
    chain_id: u64,
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    to: Address,
    input: Bytes,
) -> eyre::Result<SignedTransaction> {
    let mut tx = TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price,
        gas_limit,
        to: TxKind::Call(to),
        value: U256::ZERO,
        input,
    };

    let signature = signer.sign_transaction_sync(&mut tx)?;
    let signed = tx.into_signed(signature);
    let hash = *signed.hash();
    let raw = TxEnvelope::Legacy(signed).encoded_2718();

    Ok(SignedTransaction {
        raw: raw.into(),
        hash,
        nonce,
        gas_price,
    })
}

/// Calldata relaying a task to its destination bridge
///
/// Signature requests and collected signatures execute on the foreign bridge;
/// affirmations and transfers execute on the home bridge.
pub fn destination_call(
    task: &RelayTask,
    aggregator: &SignatureAggregator,
) -> Result<Bytes, SignatureError> {
    let call = match &task.payload {
        RelayPayload::SignatureRequest { .. } => {
            let message = aggregator.message_for(task)?;
            let signatures = aggregator.packed_signatures(task)?;
            ForeignBridge::executeSignaturesCall {
                message: Bytes::copy_from_slice(&message),
                signatures,
            }
            .abi_encode()
        }
        RelayPayload::CollectedSignatures {
            message,
            signatures,
            ..
        } => {
            if message.is_empty() || signatures.is_empty() {
                return Err(SignatureError::Signing(
                    "collected signatures task has no message or signatures".to_string(),
                ));
            }
            ForeignBridge::executeSignaturesCall {
                message: message.clone(),
                signatures: pack_signatures(signatures)?,
            }
            .abi_encode()
        }
        RelayPayload::AffirmationRequest { recipient, value } => HomeBridge::executeAffirmationCall {
            recipient: *recipient,
            value: *value,
            transactionHash: task.fingerprint.tx_hash,
        }
        .abi_encode(),
        RelayPayload::Transfer { from, value, .. } => HomeBridge::executeAffirmationCall {
            recipient: *from,
            value: *value,
            transactionHash: task.fingerprint.tx_hash,
        }
        .abi_encode(),
    };
    Ok(call.into())
}
