//! Gas budgeting for destination transactions

use crate::destination::{Action, TGAS};
use crate::error::{BridgeError, BridgeResult};

use tracing::debug;

/// Most gas a single destination transaction may attach
pub const MAX_TRANSACTION_GAS: u64 = 300 * TGAS;

/// Gas estimator for transactions
pub struct GasEstimator {
    /// Buffer percentage added to each action (e.g., 20 = 20% buffer)
    gas_buffer_percent: u64,
    max_total_gas: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_buffer_percent: 20,
            max_total_gas: MAX_TRANSACTION_GAS,
        }
    }

    /// Add the buffer to every action, rejecting plans over the per-transaction cap
    pub fn prepare(&self, actions: Vec<Action>) -> BridgeResult<Vec<Action>> {
        let buffered: Vec<Action> = actions
            .into_iter()
            .map(|action| match action {
                Action::FunctionCall {
                    method_name,
                    args,
                    gas,
                    deposit,
                } => Action::FunctionCall {
                    method_name,
                    args,
                    gas: gas.saturating_add(gas / 100 * self.gas_buffer_percent),
                    deposit,
                },
            })
            .collect();

        let total = buffered
            .iter()
            .fold(0u64, |acc, a| acc.saturating_add(a.gas()));
        if total > self.max_total_gas {
            return Err(BridgeError::Transaction(format!(
                "transaction needs {} TGas, limit is {}",
                total / TGAS,
                self.max_total_gas / TGAS
            )));
        }

        debug!("Prepared {} action(s) with {} TGas", buffered.len(), total / TGAS);
        Ok(buffered)
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(gas: u64) -> Action {
        Action::FunctionCall {
            method_name: "execute_intent".to_string(),
            args: serde_json::Value::Null,
            gas,
            deposit: 1,
        }
    }

    #[test]
    fn test_buffer_is_applied() {
        let prepared = GasEstimator::new().prepare(vec![call(30 * TGAS)]).unwrap();
        assert_eq!(prepared[0].gas(), 36 * TGAS);
    }

    #[test]
    fn test_over_cap_is_rejected() {
        let err = GasEstimator::new()
            .prepare(vec![call(200 * TGAS), call(100 * TGAS)])
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
