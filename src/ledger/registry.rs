//! Intent Registry: authoritative per-intent record and status

use super::token::TokenBook;
use crate::error::{BridgeError, BridgeResult};
use crate::events::LedgerEvent;
use crate::types::{u128_string, IntentId};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Registry-side lifecycle of an intent, in forward order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Locking,
    Locked,
    Relaying,
    Completed,
    Failed,
    Expired,
}

impl IntentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IntentStatus::Completed | IntentStatus::Failed | IntentStatus::Expired
        )
    }

    /// Status only moves forward, and never out of a terminal state
    pub fn can_transition_to(self, next: IntentStatus) -> bool {
        !self.is_terminal() && next > self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Locking => "locking",
            IntentStatus::Locked => "locked",
            IntentStatus::Relaying => "relaying",
            IntentStatus::Completed => "completed",
            IntentStatus::Failed => "failed",
            IntentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded request to move `amount` of `asset` to `receiver`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub sender: Address,
    pub receiver: String,
    pub asset: Address,
    #[serde(with = "u128_string")]
    pub amount: u128,
    pub expiration: u64,
    pub executed: bool,
    pub status: IntentStatus,
}

/// Registry of intents gated by a single operator identity
#[derive(Debug, Clone)]
pub struct IntentRegistry {
    address: Address,
    operator: Address,
    intents: HashMap<IntentId, Intent>,
}

impl IntentRegistry {
    pub fn new(address: Address, operator: Address) -> Self {
        Self {
            address,
            operator,
            intents: HashMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    /// Register a new intent owned by `caller`
    ///
    /// The caller must both hold `amount` and have approved the registry to
    /// move it, since execution later pulls the funds without the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn create_intent(
        &mut self,
        tokens: &TokenBook,
        caller: Address,
        id: IntentId,
        receiver: String,
        asset: Address,
        amount: u128,
        expiration: u64,
        now: u64,
    ) -> BridgeResult<LedgerEvent> {
        if self.intents.contains_key(&id) {
            return Err(BridgeError::AlreadyExists(id));
        }
        if expiration <= now {
            return Err(BridgeError::Expired { id, expiration, now });
        }
        if amount == 0 {
            return Err(BridgeError::InvalidAmount);
        }
        if receiver.trim().is_empty() {
            return Err(BridgeError::InvalidReceiver);
        }
        let allowance = tokens.allowance(asset, caller, self.address);
        let balance = tokens.balance_of(asset, caller);
        if allowance < amount || balance < amount {
            return Err(BridgeError::InsufficientAuthorization {
                account: caller,
                asset,
                allowance,
                balance,
                need: amount,
            });
        }

        let event = LedgerEvent::IntentCreated {
            intent_id: id.clone(),
            sender: caller,
            receiver: receiver.clone(),
            asset,
            amount,
            expiration,
        };
        self.intents.insert(
            id.clone(),
            Intent {
                id,
                sender: caller,
                receiver,
                asset,
                amount,
                expiration,
                executed: false,
                status: IntentStatus::Pending,
            },
        );
        Ok(event)
    }

    pub fn update_status(
        &mut self,
        caller: Address,
        id: &IntentId,
        status: IntentStatus,
    ) -> BridgeResult<LedgerEvent> {
        self.ensure_operator(caller, "update intent status")?;
        let intent = self
            .intents
            .get_mut(id)
            .ok_or_else(|| BridgeError::IntentNotFound(id.clone()))?;
        if !intent.status.can_transition_to(status) {
            return Err(BridgeError::InvalidStateTransition {
                from: intent.status.to_string(),
                to: status.to_string(),
            });
        }
        intent.status = status;
        Ok(LedgerEvent::IntentStatusUpdated {
            intent_id: id.clone(),
            status,
        })
    }

    /// Check every precondition of execution without changing anything
    pub(crate) fn check_executable(
        &self,
        caller: Address,
        id: &IntentId,
        now: u64,
    ) -> BridgeResult<&Intent> {
        self.ensure_operator(caller, "execute intents")?;
        let intent = self
            .intents
            .get(id)
            .ok_or_else(|| BridgeError::IntentNotFound(id.clone()))?;
        if intent.executed {
            return Err(BridgeError::AlreadyExecuted(id.clone()));
        }
        if now > intent.expiration {
            return Err(BridgeError::Expired {
                id: id.clone(),
                expiration: intent.expiration,
                now,
            });
        }
        if intent.status != IntentStatus::Pending {
            return Err(BridgeError::NotPending {
                id: id.clone(),
                status: intent.status.to_string(),
            });
        }
        Ok(intent)
    }

    /// Record a successful execution: executed flag, Relaying, then Completed
    ///
    /// Only called once custody has been taken; returns the status events in
    /// emission order around the custody move.
    pub(crate) fn record_execution(
        &mut self,
        id: &IntentId,
    ) -> BridgeResult<(LedgerEvent, Vec<LedgerEvent>)> {
        let intent = self
            .intents
            .get_mut(id)
            .ok_or_else(|| BridgeError::IntentNotFound(id.clone()))?;
        intent.executed = true;
        intent.status = IntentStatus::Completed;

        let relaying = LedgerEvent::IntentStatusUpdated {
            intent_id: id.clone(),
            status: IntentStatus::Relaying,
        };
        let completed = vec![
            LedgerEvent::IntentStatusUpdated {
                intent_id: id.clone(),
                status: IntentStatus::Completed,
            },
            LedgerEvent::IntentExecuted {
                intent_id: id.clone(),
            },
        ];
        Ok((relaying, completed))
    }

    pub fn update_operator(
        &mut self,
        caller: Address,
        new_operator: Address,
    ) -> BridgeResult<LedgerEvent> {
        self.ensure_operator(caller, "update the operator")?;
        if new_operator == Address::ZERO {
            return Err(BridgeError::InvalidRequest(
                "operator must not be the zero address".to_string(),
            ));
        }
        let previous = std::mem::replace(&mut self.operator, new_operator);
        Ok(LedgerEvent::OperatorUpdated {
            previous,
            current: new_operator,
        })
    }

    pub fn get_intent(&self, id: &IntentId) -> Option<&Intent> {
        self.intents.get(id)
    }

    fn ensure_operator(&self, caller: Address, action: &'static str) -> BridgeResult<()> {
        if caller != self.operator {
            return Err(BridgeError::Unauthorized { caller, action });
        }
        Ok(())
    }
}
