//! Destination ledger interface
//!
//! The relayer talks to the destination only through [`DestinationLedger`]:
//! it asks for the action set an execution needs, wraps it into a signed
//! transaction at the signer's next access-key nonce, and submits it.

pub mod executor;

pub use executor::{DestinationExecutor, ExecutionReceipt};

use crate::error::{BridgeError, BridgeResult};
use crate::proof::Proof;
use crate::types::{u128_string, IntentId};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// One TGas in gas units
pub const TGAS: u64 = 1_000_000_000_000;

/// Everything the destination needs to release an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub intent_id: IntentId,
    pub asset: Address,
    pub sender: Address,
    pub receiver: String,
    #[serde(with = "u128_string")]
    pub amount: u128,
    pub timestamp: u64,
    pub proof: Proof,
}

/// A destination-native transaction action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    FunctionCall {
        method_name: String,
        args: serde_json::Value,
        gas: u64,
        #[serde(with = "u128_string")]
        deposit: u128,
    },
}

impl Action {
    pub fn method_name(&self) -> &str {
        match self {
            Action::FunctionCall { method_name, .. } => method_name,
        }
    }

    pub fn gas(&self) -> u64 {
        match self {
            Action::FunctionCall { gas, .. } => *gas,
        }
    }
}

/// Transaction as submitted to the destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub signer_id: String,
    pub receiver_id: String,
    pub nonce: u64,
    pub actions: Vec<Action>,
    pub hash: B256,
}

impl SignedTransaction {
    pub fn new(
        signer_id: impl Into<String>,
        receiver_id: impl Into<String>,
        nonce: u64,
        actions: Vec<Action>,
    ) -> BridgeResult<Self> {
        let signer_id = signer_id.into();
        let receiver_id = receiver_id.into();
        let body = serde_json::to_vec(&(&signer_id, &receiver_id, nonce, &actions))
            .map_err(|e| BridgeError::Internal(format!("encoding transaction: {}", e)))?;
        let hash = B256::from_slice(&Keccak256::digest(&body));

        Ok(Self {
            signer_id,
            receiver_id,
            nonce,
            actions,
            hash,
        })
    }

    pub fn total_gas(&self) -> u64 {
        self.actions.iter().map(Action::gas).sum()
    }
}

/// Result of a transaction that the destination accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    /// The intent was released by this transaction
    Executed { tx_hash: B256 },
    /// The intent had already been released; nothing changed
    Duplicate { tx_hash: B256 },
}

impl TxOutcome {
    pub fn tx_hash(&self) -> B256 {
        match self {
            TxOutcome::Executed { tx_hash } | TxOutcome::Duplicate { tx_hash } => *tx_hash,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DestinationLedger: Send + Sync {
    fn chain(&self) -> String;

    /// Contract account transactions are addressed to
    fn executor_account(&self) -> String;

    /// Actions needed to execute `request`, in submission order
    async fn execution_plan(&self, request: &ExecutionRequest) -> BridgeResult<Vec<Action>>;

    /// Last nonce used by `account`'s access key
    async fn access_key_nonce(&self, account: &str) -> BridgeResult<u64>;

    async fn send_transaction(&self, tx: &SignedTransaction) -> BridgeResult<TxOutcome>;

    async fn is_executed(&self, intent_id: &IntentId) -> BridgeResult<bool>;
}
