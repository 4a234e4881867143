//! Lock proofs and the validator set that attests them
//!
//! A proof binds a `Locked` observation to its content hash and source block.
//! Attesters sign `content_hash ‖ block_number ‖ intent_id` with ed25519; the
//! destination accepts a proof once a quorum of distinct known validators
//! signed it.

use crate::error::{BridgeError, BridgeResult};
use crate::types::IntentId;

use alloy_primitives::{Address, B256};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashSet};

/// Hash of the transfer content carried by a proof
pub fn content_hash(
    asset: Address,
    sender: Address,
    receiver: &str,
    amount: u128,
    timestamp: u64,
) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(asset.as_slice());
    hasher.update(sender.as_slice());
    hasher.update(receiver.as_bytes());
    hasher.update(amount.to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    B256::from_slice(&hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSignature {
    /// Hex-encoded ed25519 public key
    pub public_key: String,
    /// Hex-encoded ed25519 signature over the signing payload
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub intent_id: IntentId,
    pub content_hash: B256,
    pub block_number: u64,
    pub timestamp: u64,
    pub signatures: Vec<ValidatorSignature>,
}

impl Proof {
    /// Bytes every validator signs
    pub fn signing_payload(&self) -> Vec<u8> {
        signing_payload(&self.intent_id, self.content_hash, self.block_number)
    }
}

fn signing_payload(intent_id: &IntentId, content_hash: B256, block_number: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 8 + intent_id.as_bytes().len());
    payload.extend_from_slice(content_hash.as_slice());
    payload.extend_from_slice(&block_number.to_be_bytes());
    payload.extend_from_slice(intent_id.as_bytes());
    payload
}

fn decode_key<const N: usize>(raw: &str, what: &str) -> BridgeResult<[u8; N]> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| BridgeError::Config(format!("invalid {} hex: {}", what, e)))?;
    bytes
        .try_into()
        .map_err(|_| BridgeError::Config(format!("{} must be {} bytes", what, N)))
}

/// Holds the attester keys the relayer signs proofs with
pub struct ProofSigner {
    keys: Vec<SigningKey>,
}

impl ProofSigner {
    pub fn from_hex(secret_keys: &[String]) -> BridgeResult<Self> {
        let keys = secret_keys
            .iter()
            .map(|raw| decode_key::<32>(raw, "attester key").map(|b| SigningKey::from_bytes(&b)))
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(Self { keys })
    }

    /// Signer producing proofs with an empty signature set
    pub fn unsigned() -> Self {
        Self { keys: Vec::new() }
    }

    pub fn public_keys(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|k| hex::encode(k.verifying_key().as_bytes()))
            .collect()
    }

    pub fn sign(
        &self,
        intent_id: IntentId,
        content_hash: B256,
        block_number: u64,
        timestamp: u64,
    ) -> Proof {
        let payload = signing_payload(&intent_id, content_hash, block_number);
        let signatures = self
            .keys
            .iter()
            .map(|key| ValidatorSignature {
                public_key: hex::encode(key.verifying_key().as_bytes()),
                signature: hex::encode(key.sign(&payload).to_bytes()),
            })
            .collect();

        Proof {
            intent_id,
            content_hash,
            block_number,
            timestamp,
            signatures,
        }
    }
}

/// Known validators and the number of distinct signatures a proof needs
#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
    keys: BTreeMap<String, VerifyingKey>,
    threshold: usize,
}

impl ValidatorSet {
    pub fn new(threshold: usize) -> Self {
        Self {
            keys: BTreeMap::new(),
            threshold,
        }
    }

    pub fn from_hex(public_keys: &[String], threshold: usize) -> BridgeResult<Self> {
        let mut set = Self::new(threshold);
        for key in public_keys {
            set.add(key)?;
        }
        if !set.keys.is_empty() && threshold == 0 {
            return Err(BridgeError::Config(
                "required signatures must be greater than zero".to_string(),
            ));
        }
        Ok(set)
    }

    /// Returns false if the key was already present
    pub fn add(&mut self, public_key: &str) -> BridgeResult<bool> {
        let bytes = decode_key::<32>(public_key, "validator key")?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| BridgeError::Config(format!("invalid validator key: {}", e)))?;
        Ok(self.keys.insert(hex::encode(bytes), key).is_none())
    }

    pub fn remove(&mut self, public_key: &str) -> bool {
        self.keys
            .remove(&public_key.trim_start_matches("0x").to_lowercase())
            .is_some()
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.keys
            .contains_key(&public_key.trim_start_matches("0x").to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Count distinct known validators with a valid signature and require quorum
    pub fn verify(&self, proof: &Proof) -> BridgeResult<usize> {
        let payload = proof.signing_payload();
        let mut signers = HashSet::new();

        for sig in &proof.signatures {
            let normalized = sig.public_key.trim_start_matches("0x").to_lowercase();
            let Some(key) = self.keys.get(&normalized) else {
                continue;
            };
            let Ok(raw) = hex::decode(sig.signature.trim_start_matches("0x")) else {
                continue;
            };
            let Ok(signature) = Signature::from_slice(&raw) else {
                continue;
            };
            if key.verify(&payload, &signature).is_ok() {
                signers.insert(normalized);
            }
        }

        if signers.len() < self.threshold {
            return Err(BridgeError::Transaction(format!(
                "insufficient validator signatures: {} of {} required",
                signers.len(),
                self.threshold
            )));
        }
        Ok(signers.len())
    }
}
