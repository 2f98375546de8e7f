//! Signature Aggregator
//!
//! Validators sign a fixed 104-byte relay message per task with an EIP-191
//! personal signature. Signatures land in the task store, which releases the
//! task once the quorum of distinct validators has signed. At send time the
//! collected signatures are packed into the `count ‖ v[] ‖ r[] ‖ s[]` layout
//! the bridge contracts expect.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use alloy::primitives::{Address, Bytes, PrimitiveSignature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use tracing::{debug, info, warn};

use crate::error::SignatureError;
use crate::metrics;
use crate::store::{SignatureOutcome, TaskStore};
use crate::types::{RelayTask, ValidatorSignature};

/// Length of the message validators sign
pub const RELAY_MESSAGE_LEN: usize = 20 + 32 + 32 + 20;

/// Length of one `r ‖ s ‖ v` signature
pub const SIGNATURE_LEN: usize = 65;

/// `ceil(2n / 3)`, the quorum used when only a validator set is configured
pub fn default_quorum(validator_count: usize) -> usize {
    (2 * validator_count).div_ceil(3)
}

/// Lowercase `0x` form used as the validator id
pub fn validator_id(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Message validators sign for a task:
/// `recipient (20) ‖ value (32) ‖ source tx hash (32) ‖ destination bridge (20)`
pub fn relay_message(
    recipient: Address,
    value: U256,
    source_tx_hash: B256,
    destination_bridge: Address,
) -> [u8; RELAY_MESSAGE_LEN] {
    let mut message = [0u8; RELAY_MESSAGE_LEN];
    message[..20].copy_from_slice(recipient.as_slice());
    message[20..52].copy_from_slice(&value.to_be_bytes::<32>());
    message[52..84].copy_from_slice(source_tx_hash.as_slice());
    message[84..].copy_from_slice(destination_bridge.as_slice());
    message
}

/// Split a 65-byte `r ‖ s ‖ v` signature; `v` may be 0/1 or 27/28
fn parse_signature(bytes: &[u8]) -> Result<PrimitiveSignature, String> {
    if bytes.len() != SIGNATURE_LEN {
        return Err(format!("expected {} bytes, got {}", SIGNATURE_LEN, bytes.len()));
    }
    let parity = match bytes[64] {
        0 | 27 => false,
        1 | 28 => true,
        v => return Err(format!("invalid recovery id {}", v)),
    };
    let r = U256::from_be_slice(&bytes[..32]);
    let s = U256::from_be_slice(&bytes[32..64]);
    Ok(PrimitiveSignature::new(r, s, parity))
}

/// Signs, verifies and packs validator signatures
pub struct SignatureAggregator {
    signer: PrivateKeySigner,
    validator_id: String,
    quorum: usize,
    /// Empty means any recovered signer is accepted
    validators: BTreeSet<Address>,
    /// Bridge contract per destination chain id
    bridges: HashMap<u64, Address>,
}

impl SignatureAggregator {
    pub fn new(
        signer: PrivateKeySigner,
        quorum: usize,
        validators: impl IntoIterator<Item = Address>,
        bridges: HashMap<u64, Address>,
    ) -> Self {
        let validator_id = validator_id(&signer.address());
        let validators: BTreeSet<Address> = validators.into_iter().collect();

        if !validators.is_empty() && !validators.contains(&signer.address()) {
            warn!(
                validator = %validator_id,
                "Validator key is not part of the configured validator set"
            );
        }

        info!(
            validator = %validator_id,
            quorum,
            validator_set = validators.len(),
            "Signature aggregator initialized"
        );

        Self {
            signer,
            validator_id,
            quorum: quorum.max(1),
            validators,
            bridges,
        }
    }

    pub fn validator_id(&self) -> &str {
        &self.validator_id
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Single-validator bridges skip the quorum wait entirely
    pub fn is_single_validator(&self) -> bool {
        self.quorum <= 1
    }

    /// Whether this validator's key belongs to the configured set; always
    /// true without a set
    pub fn is_member(&self) -> bool {
        self.validators.is_empty() || self.validators.contains(&self.signer.address())
    }

    /// Most signatures a collected-signatures event can legitimately carry
    pub fn max_signers(&self) -> usize {
        if self.validators.is_empty() {
            u8::MAX as usize
        } else {
            self.validators.len()
        }
    }

    /// Relay message for a task, or `Unsignable` for collected signatures
    pub fn message_for(&self, task: &RelayTask) -> Result<[u8; RELAY_MESSAGE_LEN], SignatureError> {
        let (recipient, value) = task
            .payload
            .recipient_and_value()
            .ok_or(SignatureError::Unsignable(task.event_type))?;
        let bridge = self
            .bridges
            .get(&task.destination_chain_id)
            .ok_or_else(|| {
                SignatureError::Signing(format!(
                    "no bridge configured for chain {}",
                    task.destination_chain_id
                ))
            })?;
        Ok(relay_message(
            recipient,
            value,
            task.fingerprint.tx_hash,
            *bridge,
        ))
    }

    /// Sign a task's relay message with this validator's key
    pub fn sign(&self, task: &RelayTask) -> Result<ValidatorSignature, SignatureError> {
        let message = self.message_for(task)?;
        let signature = self
            .signer
            .sign_message_sync(&message)
            .map_err(|e| SignatureError::Signing(e.to_string()))?;

        Ok(ValidatorSignature {
            validator_id: self.validator_id.clone(),
            fingerprint: task.fingerprint,
            signature: Bytes::copy_from_slice(&signature.as_bytes()),
        })
    }

    /// Check that `signature` was produced by its claimed validator over this
    /// task's relay message
    pub fn verify(&self, task: &RelayTask, signature: &ValidatorSignature) -> Result<(), SignatureError> {
        let invalid = |reason: String| SignatureError::Invalid {
            validator: signature.validator_id.clone(),
            reason,
        };

        let claimed = Address::from_str(&signature.validator_id)
            .map_err(|e| invalid(format!("validator id is not an address: {}", e)))?;
        if !self.validators.is_empty() && !self.validators.contains(&claimed) {
            return Err(SignatureError::UnknownValidator(signature.validator_id.clone()));
        }

        let message = self.message_for(task)?;
        let parsed = parse_signature(&signature.signature).map_err(invalid)?;
        let recovered = parsed
            .recover_address_from_msg(message)
            .map_err(|e| invalid(e.to_string()))?;

        if recovered != claimed {
            return Err(invalid(format!("recovered signer {}", recovered)));
        }
        Ok(())
    }

    /// Sign a task and check the signature the way every other validator
    /// will, so nothing that cannot count toward the quorum is ever stored
    pub fn attest(&self, task: &RelayTask) -> Result<ValidatorSignature, SignatureError> {
        let signature = self.sign(task)?;
        self.verify(task, &signature)?;
        Ok(signature)
    }

    /// Sign a task and record the verified signature in the store
    pub async fn submit(
        &self,
        store: &dyn TaskStore,
        task: &RelayTask,
    ) -> eyre::Result<SignatureOutcome> {
        let signature = self.attest(task)?;
        let outcome = crate::store::retry_on_conflict(|| {
            store.record_signature(
                &signature.fingerprint,
                &signature.validator_id,
                signature.signature.clone(),
            )
        })
        .await?;

        record_outcome(&outcome);
        debug!(
            fingerprint = %task.fingerprint,
            validator = %self.validator_id,
            ?outcome,
            "Submitted validator signature"
        );
        Ok(outcome)
    }

    /// Valid signatures of a task keyed by validator id; invalid ones are
    /// logged and dropped
    pub fn valid_signatures<'a>(&self, task: &'a RelayTask) -> BTreeMap<&'a str, &'a Bytes> {
        task.signatures
            .iter()
            .filter(|(validator, signature)| {
                let candidate = ValidatorSignature {
                    validator_id: (*validator).clone(),
                    fingerprint: task.fingerprint,
                    signature: (*signature).clone(),
                };
                match self.verify(task, &candidate) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            fingerprint = %task.fingerprint,
                            validator = %validator,
                            error = %e,
                            "Dropping invalid signature"
                        );
                        false
                    }
                }
            })
            .map(|(validator, signature)| (validator.as_str(), signature))
            .collect()
    }

    /// Verified, packed signatures for a task's destination call
    pub fn packed_signatures(&self, task: &RelayTask) -> Result<Bytes, SignatureError> {
        let valid = self.valid_signatures(task);
        if valid.len() < self.quorum {
            return Err(SignatureError::Signing(format!(
                "only {} of {} required signatures are valid",
                valid.len(),
                self.quorum
            )));
        }
        pack_signatures(valid.into_values().take(self.quorum))
    }
}

/// Pack signatures as `count (1) ‖ v₁..vₙ ‖ r₁..rₙ ‖ s₁..sₙ`
///
/// Callers pass signatures already ordered by validator id.
pub fn pack_signatures<'a, I>(signatures: I) -> Result<Bytes, SignatureError>
where
    I: IntoIterator<Item = &'a Bytes>,
{
    let signatures: Vec<&Bytes> = signatures.into_iter().collect();
    let count = u8::try_from(signatures.len())
        .map_err(|_| SignatureError::TooManySignatures(signatures.len()))?;

    let mut v = Vec::with_capacity(signatures.len());
    let mut r = Vec::with_capacity(signatures.len() * 32);
    let mut s = Vec::with_capacity(signatures.len() * 32);

    for signature in &signatures {
        let parsed = parse_signature(signature).map_err(|reason| SignatureError::Invalid {
            validator: "packed".to_string(),
            reason,
        })?;
        v.push(27 + parsed.v() as u8);
        r.extend_from_slice(&parsed.r().to_be_bytes::<32>());
        s.extend_from_slice(&parsed.s().to_be_bytes::<32>());
    }

    let mut packed = Vec::with_capacity(1 + v.len() + r.len() + s.len());
    packed.push(count);
    packed.extend(v);
    packed.extend(r);
    packed.extend(s);
    Ok(packed.into())
}

fn record_outcome(outcome: &SignatureOutcome) {
    match outcome {
        SignatureOutcome::Recorded { .. } => metrics::SIGNATURES_RECORDED.inc(),
        SignatureOutcome::Released => {
            metrics::SIGNATURES_RECORDED.inc();
            metrics::QUORUM_RELEASES.inc();
        }
        SignatureOutcome::Duplicate { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RelayPayload;
    use crate::types::{Fingerprint, Status};

    const HOME: u64 = 100;
    const FOREIGN: u64 = 200;

    fn bridges() -> HashMap<u64, Address> {
        HashMap::from([
            (HOME, Address::repeat_byte(0x01)),
            (FOREIGN, Address::repeat_byte(0x02)),
        ])
    }

    fn task() -> RelayTask {
        RelayTask::new(
            Fingerprint::new(HOME, B256::repeat_byte(0x33), 0),
            FOREIGN,
            RelayPayload::SignatureRequest {
                recipient: Address::repeat_byte(0xaa),
                value: U256::from(1_000u64),
            },
            10,
            8,
            Status::AwaitingQuorum,
        )
    }

    fn aggregator(signer: PrivateKeySigner, quorum: usize, set: &[Address]) -> SignatureAggregator {
        SignatureAggregator::new(signer, quorum, set.iter().copied(), bridges())
    }

    #[test]
    fn test_default_quorum() {
        assert_eq!(default_quorum(1), 1);
        assert_eq!(default_quorum(3), 2);
        assert_eq!(default_quorum(4), 3);
        assert_eq!(default_quorum(5), 4);
        assert_eq!(default_quorum(7), 5);
    }

    #[test]
    fn test_relay_message_layout() {
        let message = relay_message(
            Address::repeat_byte(0xaa),
            U256::from(0x0102u64),
            B256::repeat_byte(0x33),
            Address::repeat_byte(0x02),
        );
        assert_eq!(message.len(), 104);
        assert_eq!(&message[..20], &[0xaa; 20]);
        assert_eq!(message[50], 0x01);
        assert_eq!(message[51], 0x02);
        assert_eq!(&message[52..84], &[0x33; 32]);
        assert_eq!(&message[84..], &[0x02; 20]);
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = PrivateKeySigner::random();
        let agg = aggregator(signer.clone(), 1, &[]);
        let task = task();

        let signature = agg.sign(&task).unwrap();
        assert_eq!(signature.validator_id, validator_id(&signer.address()));
        assert_eq!(signature.signature.len(), SIGNATURE_LEN);
        agg.verify(&task, &signature).unwrap();
    }

    #[test]
    fn test_verify_rejects_impersonation() {
        let honest = PrivateKeySigner::random();
        let forger = PrivateKeySigner::random();
        let task = task();

        let mut forged = aggregator(forger, 1, &[]).sign(&task).unwrap();
        forged.validator_id = validator_id(&honest.address());

        let err = aggregator(honest, 1, &[]).verify(&task, &forged).unwrap_err();
        assert!(matches!(err, SignatureError::Invalid { .. }));
    }

    #[test]
    fn test_verify_rejects_validator_outside_set() {
        let inside = PrivateKeySigner::random();
        let outside = PrivateKeySigner::random();
        let task = task();

        let signature = aggregator(outside, 1, &[]).sign(&task).unwrap();
        let err = aggregator(inside.clone(), 1, &[inside.address()])
            .verify(&task, &signature)
            .unwrap_err();
        assert!(matches!(err, SignatureError::UnknownValidator(_)));
    }

    #[test]
    fn test_attest_refuses_key_outside_set() {
        let inside = PrivateKeySigner::random();
        let outside = PrivateKeySigner::random();
        let task = task();

        let member = aggregator(inside.clone(), 1, &[inside.address()]);
        assert!(member.is_member());
        member.attest(&task).unwrap();

        let stranger = aggregator(outside, 1, &[inside.address()]);
        assert!(!stranger.is_member());
        assert!(matches!(
            stranger.attest(&task),
            Err(SignatureError::UnknownValidator(_))
        ));
    }

    #[tokio::test]
    async fn test_outsider_signature_never_reaches_the_store() {
        use crate::store::MemoryTaskStore;

        let members: Vec<PrivateKeySigner> = (0..3).map(|_| PrivateKeySigner::random()).collect();
        let set: Vec<Address> = members.iter().map(|m| m.address()).collect();
        let store = MemoryTaskStore::new(2);
        let task = task();
        store.upsert(&task).await.unwrap();

        let first = aggregator(members[0].clone(), 2, &set)
            .submit(&store, &task)
            .await
            .unwrap();
        assert_eq!(first, SignatureOutcome::Recorded { count: 1 });

        let outsider = aggregator(PrivateKeySigner::random(), 2, &set);
        assert!(outsider.submit(&store, &task).await.is_err());

        let stored = store.get(&task.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::AwaitingQuorum);
        assert_eq!(stored.signature_count(), 1);
    }

    #[test]
    fn test_max_signers_follows_the_set() {
        let signer = PrivateKeySigner::random();
        assert_eq!(aggregator(signer.clone(), 1, &[]).max_signers(), 255);
        let set = [signer.address(), Address::repeat_byte(1), Address::repeat_byte(2)];
        assert_eq!(aggregator(signer, 2, &set).max_signers(), 3);
    }

    #[test]
    fn test_collected_signatures_are_unsignable() {
        let agg = aggregator(PrivateKeySigner::random(), 1, &[]);
        let mut task = task();
        task.payload = RelayPayload::CollectedSignatures {
            authority: Address::ZERO,
            message_hash: B256::ZERO,
            signature_count: 1,
            message: Bytes::new(),
            signatures: vec![],
        };
        task.event_type = task.payload.kind();
        assert!(matches!(agg.sign(&task), Err(SignatureError::Unsignable(_))));
    }

    #[test]
    fn test_pack_orders_and_truncates_to_quorum() {
        let signers: Vec<PrivateKeySigner> = (0..3).map(|_| PrivateKeySigner::random()).collect();
        let set: Vec<Address> = signers.iter().map(|s| s.address()).collect();
        let mut task = task();
        for signer in &signers {
            let signature = aggregator(signer.clone(), 2, &set).sign(&task).unwrap();
            task.add_signature(signature);
        }

        let agg = aggregator(signers[0].clone(), 2, &set);
        let packed = agg.packed_signatures(&task).unwrap();
        assert_eq!(packed.len(), 1 + 2 + 2 * 32 + 2 * 32);
        assert_eq!(packed[0], 2);
        assert!(packed[1] == 27 || packed[1] == 28);

        // First packed r belongs to the lowest validator id
        let lowest = task.signatures.values().next().unwrap();
        assert_eq!(&packed[3..35], &lowest[..32]);
    }

    #[test]
    fn test_packing_requires_quorum_of_valid_signatures() {
        let signer = PrivateKeySigner::random();
        let agg = aggregator(signer, 2, &[]);
        let mut task = task();
        task.add_signature(agg.sign(&task).unwrap());
        task.add_signature(ValidatorSignature {
            validator_id: validator_id(&Address::repeat_byte(0x55)),
            fingerprint: task.fingerprint,
            signature: Bytes::from(vec![0u8; SIGNATURE_LEN]),
        });
        assert!(agg.packed_signatures(&task).is_err());
    }

    #[test]
    fn test_pack_rejects_malformed_signature() {
        let bad = Bytes::from(vec![1u8; 10]);
        assert!(pack_signatures([&bad]).is_err());
    }
}
