//! Persisted records for transfers and relays

use crate::error::BridgeError;
use crate::types::{u128_string, IntentId};

use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Orchestrator-side transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        !self.is_terminal() && next > self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "processing" => Ok(TransferStatus::Processing),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(BridgeError::Internal(format!("unknown transfer status {}", other))),
        }
    }
}

/// A transfer as tracked by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: IntentId,
    pub source_chain: String,
    pub target_chain: String,
    pub sender: Address,
    pub token: Address,
    #[serde(with = "u128_string")]
    pub amount: u128,
    pub receiver: String,
    pub status: TransferStatus,
    pub error: Option<String>,
    /// Source block that carried the `Locked` event
    pub lock_block: Option<u64>,
    /// Custody was released back to the sender
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: IntentId,
        source_chain: impl Into<String>,
        target_chain: impl Into<String>,
        sender: Address,
        token: Address,
        amount: u128,
        receiver: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_chain: source_chain.into(),
            target_chain: target_chain.into(),
            sender,
            token,
            amount,
            receiver: receiver.into(),
            status: TransferStatus::Pending,
            error: None,
            lock_block: None,
            refunded: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Relayer-side delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    InFlight,
    Delivered,
    Duplicate,
    DeadLetter,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RelayState::InFlight)
    }

    /// Destination released the intent (now or earlier)
    pub fn is_delivered(self) -> bool {
        matches!(self, RelayState::Delivered | RelayState::Duplicate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayState::InFlight => "in_flight",
            RelayState::Delivered => "delivered",
            RelayState::Duplicate => "duplicate",
            RelayState::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayState {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(RelayState::InFlight),
            "delivered" => Ok(RelayState::Delivered),
            "duplicate" => Ok(RelayState::Duplicate),
            "dead_letter" => Ok(RelayState::DeadLetter),
            other => Err(BridgeError::Internal(format!("unknown relay state {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub intent_id: IntentId,
    pub state: RelayState,
    pub attempts: u32,
    pub destination_tx: Option<B256>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RelayRecord {
    pub fn in_flight(intent_id: IntentId) -> Self {
        Self {
            intent_id,
            state: RelayState::InFlight,
            attempts: 0,
            destination_tx: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}
