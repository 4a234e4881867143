//! Source ledger event types
//!
//! Defines the events emitted by the Lock Store and Intent Registry, and the
//! envelope that positions each one in the ledger's event log.

use crate::ledger::IntentStatus;
use crate::types::{u128_string, IntentId};

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

/// Events emitted by the source ledger contracts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// Asset moved into Lock Store custody
    Locked {
        intent_id: IntentId,
        asset: Address,
        from: Address,
        receiver_hint: String,
        #[serde(with = "u128_string")]
        amount: u128,
        timestamp: u64,
    },

    /// Asset released out of Lock Store custody
    Unlocked {
        intent_id: IntentId,
        asset: Address,
        to: Address,
        #[serde(with = "u128_string")]
        amount: u128,
        timestamp: u64,
    },

    /// Asset added to or removed from the Lock Store allow-list
    AssetSupportChanged { asset: Address, supported: bool },

    /// Intent registered
    IntentCreated {
        intent_id: IntentId,
        sender: Address,
        receiver: String,
        asset: Address,
        #[serde(with = "u128_string")]
        amount: u128,
        expiration: u64,
    },

    /// Intent status changed
    IntentStatusUpdated {
        intent_id: IntentId,
        status: IntentStatus,
    },

    /// Intent executed (custody taken, registry side complete)
    IntentExecuted { intent_id: IntentId },

    /// Registry operator rotated
    OperatorUpdated { previous: Address, current: Address },
}

impl LedgerEvent {
    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::Locked { .. } => "locked",
            LedgerEvent::Unlocked { .. } => "unlocked",
            LedgerEvent::AssetSupportChanged { .. } => "asset_support_changed",
            LedgerEvent::IntentCreated { .. } => "intent_created",
            LedgerEvent::IntentStatusUpdated { .. } => "intent_status_updated",
            LedgerEvent::IntentExecuted { .. } => "intent_executed",
            LedgerEvent::OperatorUpdated { .. } => "operator_updated",
        }
    }

    /// Intent this event belongs to, if any
    pub fn intent_id(&self) -> Option<&IntentId> {
        match self {
            LedgerEvent::Locked { intent_id, .. }
            | LedgerEvent::Unlocked { intent_id, .. }
            | LedgerEvent::IntentCreated { intent_id, .. }
            | LedgerEvent::IntentStatusUpdated { intent_id, .. }
            | LedgerEvent::IntentExecuted { intent_id } => Some(intent_id),
            LedgerEvent::AssetSupportChanged { .. } | LedgerEvent::OperatorUpdated { .. } => None,
        }
    }

    /// Check if this event requires relay action
    pub fn requires_action(&self) -> bool {
        matches!(self, LedgerEvent::Locked { .. })
    }
}

/// Position of an event in the ledger log: (block number, log index)
pub type Cursor = (u64, u32);

/// An event together with where it was emitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub block_number: u64,
    pub log_index: u32,
    pub tx_hash: B256,
    pub event: LedgerEvent,
}

impl EventEnvelope {
    pub fn cursor(&self) -> Cursor {
        (self.block_number, self.log_index)
    }
}
