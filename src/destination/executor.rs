//! In-process destination contract that releases intents
//!
//! Models the destination-side executor: only the agent account may submit,
//! every execution is checked against the validator quorum, and each intent id
//! is released at most once. Receivers unknown to a token contract must be
//! registered with a storage deposit before they can be credited.

use super::{Action, DestinationLedger, ExecutionRequest, SignedTransaction, TxOutcome, TGAS};
use crate::config::DestinationConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::proof::{content_hash, ValidatorSet};
use crate::types::IntentId;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Storage deposit a token contract charges to register an account (yocto)
pub const STORAGE_DEPOSIT: u128 = 1_250_000_000_000_000_000_000;
pub const STORAGE_DEPOSIT_GAS: u64 = 10 * TGAS;
pub const EXECUTE_GAS: u64 = 30 * TGAS;
/// Attached to token transfers, as token contracts require
pub const ONE_YOCTO: u128 = 1;

/// Record of a released intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReceipt {
    pub tx_hash: B256,
    pub token: String,
    pub receiver: String,
    pub amount: u128,
}

#[derive(Debug, Clone, Default)]
struct ExecutorState {
    executed: HashMap<IntentId, ExecutionReceipt>,
    validators: ValidatorSet,
    /// (token, account) -> balance
    balances: HashMap<(String, String), u128>,
    /// (token, account) registered for storage
    registered: HashSet<(String, String)>,
    nonces: HashMap<String, u64>,
    /// Accepted execute_intent submissions (executed or duplicate), per intent
    submissions: HashMap<IntentId, u32>,
}

#[derive(Deserialize)]
struct StorageDepositArgs {
    token: String,
    account_id: String,
}

enum Applied {
    Executed,
    Duplicate,
}

pub struct DestinationExecutor {
    chain: String,
    account: String,
    owner: String,
    agent: String,
    tokens: HashMap<Address, String>,
    state: Mutex<ExecutorState>,
    failures_to_inject: AtomicU32,
}

impl DestinationExecutor {
    pub fn new(
        chain: impl Into<String>,
        account: impl Into<String>,
        owner: impl Into<String>,
        agent: impl Into<String>,
        validators: ValidatorSet,
        tokens: HashMap<Address, String>,
    ) -> Self {
        Self {
            chain: chain.into(),
            account: account.into(),
            owner: owner.into(),
            agent: agent.into(),
            tokens,
            state: Mutex::new(ExecutorState {
                validators,
                ..Default::default()
            }),
            failures_to_inject: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &DestinationConfig, agent: &str) -> BridgeResult<Self> {
        let validators = ValidatorSet::from_hex(&config.validators, config.required_signatures)?;
        let tokens = config
            .token_mappings
            .iter()
            .map(|m| (m.asset, m.token.clone()))
            .collect();

        info!(
            "Destination executor {} on {}: {} validator(s), quorum {}",
            config.executor_account,
            config.chain,
            validators.len(),
            validators.threshold()
        );
        Ok(Self::new(
            config.chain.clone(),
            config.executor_account.clone(),
            config.owner_account.clone(),
            agent,
            validators,
            tokens,
        ))
    }

    pub async fn add_validator(&self, caller: &str, public_key: &str) -> BridgeResult<bool> {
        self.ensure_owner(caller, "add validators")?;
        self.state.lock().await.validators.add(public_key)
    }

    pub async fn remove_validator(&self, caller: &str, public_key: &str) -> BridgeResult<bool> {
        self.ensure_owner(caller, "remove validators")?;
        Ok(self.state.lock().await.validators.remove(public_key))
    }

    pub async fn is_validator(&self, public_key: &str) -> bool {
        self.state.lock().await.validators.contains(public_key)
    }

    pub async fn get_intent_status(&self, intent_id: &IntentId) -> Option<ExecutionReceipt> {
        self.state.lock().await.executed.get(intent_id).cloned()
    }

    pub async fn balance_of(&self, token: &str, account: &str) -> u128 {
        self.state
            .lock()
            .await
            .balances
            .get(&(token.to_string(), account.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of accepted execute transactions for `intent_id`
    pub async fn submissions_for(&self, intent_id: &IntentId) -> u32 {
        self.state
            .lock()
            .await
            .submissions
            .get(intent_id)
            .copied()
            .unwrap_or(0)
    }

    /// Make the next `count` submissions fail with a connection error
    pub fn inject_failures(&self, count: u32) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    fn token_for(&self, asset: Address) -> BridgeResult<&str> {
        self.tokens
            .get(&asset)
            .map(String::as_str)
            .ok_or(BridgeError::UnsupportedAsset(asset))
    }

    fn ensure_owner(&self, caller: &str, action: &'static str) -> BridgeResult<()> {
        if caller != self.owner {
            return Err(BridgeError::AccountUnauthorized {
                account: caller.to_string(),
                action,
            });
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(
        &self,
        state: &mut ExecutorState,
        action: &Action,
        tx_hash: B256,
    ) -> BridgeResult<Applied> {
        let Action::FunctionCall {
            method_name,
            args,
            deposit,
            ..
        } = action;

        match method_name.as_str() {
            "storage_deposit" => {
                let args: StorageDepositArgs = serde_json::from_value(args.clone())
                    .map_err(|e| {
                        BridgeError::Transaction(format!("bad storage_deposit args: {}", e))
                    })?;
                if *deposit < STORAGE_DEPOSIT {
                    return Err(BridgeError::Transaction(format!(
                        "storage deposit {} below required {}",
                        deposit, STORAGE_DEPOSIT
                    )));
                }
                state.registered.insert((args.token, args.account_id));
                Ok(Applied::Executed)
            }
            "execute_intent" => {
                let request: ExecutionRequest = serde_json::from_value(args.clone())
                    .map_err(|e| {
                        BridgeError::Transaction(format!("bad execute_intent args: {}", e))
                    })?;
                *state.submissions.entry(request.intent_id.clone()).or_insert(0) += 1;

                if state.executed.contains_key(&request.intent_id) {
                    return Ok(Applied::Duplicate);
                }
                if *deposit != ONE_YOCTO {
                    return Err(BridgeError::Transaction(
                        "execute_intent requires exactly one yocto attached".to_string(),
                    ));
                }
                self.verify(state, &request)?;

                let token = self.token_for(request.asset)?.to_string();
                let key = (token.clone(), request.receiver.clone());
                if !state.registered.contains(&key) {
                    return Err(BridgeError::Transaction(format!(
                        "{} is not registered with {}",
                        request.receiver, token
                    )));
                }
                let balance = state.balances.entry(key).or_insert(0);
                *balance = balance
                    .checked_add(request.amount)
                    .ok_or_else(|| BridgeError::Transaction("balance overflow".to_string()))?;

                state.executed.insert(
                    request.intent_id.clone(),
                    ExecutionReceipt {
                        tx_hash,
                        token,
                        receiver: request.receiver.clone(),
                        amount: request.amount,
                    },
                );
                Ok(Applied::Executed)
            }
            other => Err(BridgeError::Transaction(format!("unknown method {}", other))),
        }
    }

    fn verify(&self, state: &ExecutorState, request: &ExecutionRequest) -> BridgeResult<()> {
        let proof = &request.proof;
        if proof.intent_id != request.intent_id {
            return Err(BridgeError::Transaction("proof is for another intent".to_string()));
        }
        let expected = content_hash(
            request.asset,
            request.sender,
            &request.receiver,
            request.amount,
            request.timestamp,
        );
        if proof.content_hash != expected {
            return Err(BridgeError::Transaction("proof content hash mismatch".to_string()));
        }
        let signers = state.validators.verify(proof)?;
        debug!("Intent {} attested by {} validator(s)", request.intent_id, signers);
        Ok(())
    }
}

#[async_trait]
impl DestinationLedger for DestinationExecutor {
    fn chain(&self) -> String {
        self.chain.clone()
    }

    fn executor_account(&self) -> String {
        self.account.clone()
    }

    async fn execution_plan(&self, request: &ExecutionRequest) -> BridgeResult<Vec<Action>> {
        let token = self.token_for(request.asset)?.to_string();
        let registered = self
            .state
            .lock()
            .await
            .registered
            .contains(&(token.clone(), request.receiver.clone()));

        let mut actions = Vec::with_capacity(2);
        if !registered {
            actions.push(Action::FunctionCall {
                method_name: "storage_deposit".to_string(),
                args: serde_json::json!({ "token": token, "account_id": request.receiver }),
                gas: STORAGE_DEPOSIT_GAS,
                deposit: STORAGE_DEPOSIT,
            });
        }
        actions.push(Action::FunctionCall {
            method_name: "execute_intent".to_string(),
            args: serde_json::to_value(request)
                .map_err(|e| BridgeError::Internal(format!("encoding request: {}", e)))?,
            gas: EXECUTE_GAS,
            deposit: ONE_YOCTO,
        });
        Ok(actions)
    }

    async fn access_key_nonce(&self, account: &str) -> BridgeResult<u64> {
        Ok(self
            .state
            .lock()
            .await
            .nonces
            .get(account)
            .copied()
            .unwrap_or(0))
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> BridgeResult<TxOutcome> {
        if self.take_injected_failure() {
            warn!("Dropping transaction {} (injected failure)", tx.hash);
            return Err(BridgeError::ChainConnection {
                chain: self.chain.clone(),
                message: "connection reset".to_string(),
            });
        }
        if tx.signer_id != self.agent {
            return Err(BridgeError::AccountUnauthorized {
                account: tx.signer_id.clone(),
                action: "execute intents",
            });
        }
        if tx.receiver_id != self.account {
            return Err(BridgeError::Transaction(format!(
                "transaction addressed to {}, expected {}",
                tx.receiver_id, self.account
            )));
        }

        let mut state = self.state.lock().await;
        let current = state.nonces.get(&tx.signer_id).copied().unwrap_or(0);
        if tx.nonce <= current {
            return Err(BridgeError::Nonce {
                signer: tx.signer_id.clone(),
                message: format!("nonce {} already used (current {})", tx.nonce, current),
            });
        }
        // An included transaction consumes its nonce whatever its actions do.
        state.nonces.insert(tx.signer_id.clone(), tx.nonce);

        let mut working = state.clone();
        let mut duplicate = false;
        for action in &tx.actions {
            if let Applied::Duplicate = self.apply(&mut working, action, tx.hash)? {
                duplicate = true;
                break;
            }
        }

        if duplicate {
            // Only the submission counter survives a duplicate.
            state.submissions = working.submissions;
            debug!("Transaction {} repeats an executed intent", tx.hash);
            return Ok(TxOutcome::Duplicate { tx_hash: tx.hash });
        }

        *state = working;
        info!("Transaction {} executed on {}", tx.hash, self.chain);
        Ok(TxOutcome::Executed { tx_hash: tx.hash })
    }

    async fn is_executed(&self, intent_id: &IntentId) -> BridgeResult<bool> {
        Ok(self.state.lock().await.executed.contains_key(intent_id))
    }
}
