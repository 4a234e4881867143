//! Source ledger: the authoritative home of the Lock Store and Intent Registry
//!
//! Every entrypoint runs under one exclusive ledger lock, so calls are
//! serialized exactly like transactions in a block. A call either commits all
//! of its state changes and events or none of them. Committed events are
//! appended to the log and broadcast to subscribers.

pub mod lock_store;
pub mod registry;
pub mod token;

pub use lock_store::LockStore;
pub use registry::{Intent, IntentRegistry, IntentStatus};
pub use token::TokenBook;

use crate::config::SourceConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{Cursor, EventEnvelope, LedgerEvent};
use crate::types::{unix_now, IntentId};

use alloy_primitives::{Address, B256};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

struct LedgerState {
    tokens: TokenBook,
    lock_store: LockStore,
    registry: IntentRegistry,
    block_number: u64,
    log: Vec<EventEnvelope>,
}

/// In-process source ledger hosting both contracts
pub struct SourceLedger {
    chain: String,
    /// Identity of this ledger's event log; block numbering restarts with it
    instance: String,
    state: Mutex<LedgerState>,
    events: RwLock<broadcast::Sender<EventEnvelope>>,
    event_capacity: usize,
    /// Seconds added to wall-clock time
    time_offset: AtomicI64,
}

impl SourceLedger {
    pub fn new(
        chain: impl Into<String>,
        lock_store: LockStore,
        registry: IntentRegistry,
        event_capacity: usize,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity);
        Self {
            chain: chain.into(),
            instance: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(LedgerState {
                tokens: TokenBook::new(),
                lock_store,
                registry,
                block_number: 0,
                log: Vec::new(),
            }),
            events: RwLock::new(event_tx),
            event_capacity,
            time_offset: AtomicI64::new(0),
        }
    }

    /// Build the ledger from configuration, applying the asset allow-list and genesis
    pub async fn from_config(config: &SourceConfig) -> BridgeResult<Self> {
        let ledger = Self::new(
            config.chain.clone(),
            LockStore::new(config.lock_store_address, config.owner, config.operator),
            IntentRegistry::new(config.registry_address, config.operator),
            config.event_capacity,
        );

        for asset in &config.supported_assets {
            ledger.add_supported_asset(config.owner, *asset).await?;
        }
        for allocation in &config.genesis {
            ledger
                .mint(allocation.asset, allocation.account, allocation.balance)
                .await?;
            if allocation.registry_allowance > 0 {
                ledger
                    .approve(
                        allocation.asset,
                        allocation.account,
                        config.registry_address,
                        allocation.registry_allowance,
                    )
                    .await;
            }
        }

        info!(
            "Source ledger {} ready: {} supported asset(s), {} genesis allocation(s)",
            config.chain,
            config.supported_assets.len(),
            config.genesis.len()
        );
        Ok(ledger)
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Ledger time in unix seconds
    pub fn now(&self) -> u64 {
        let offset = self.time_offset.load(Ordering::SeqCst);
        (unix_now() as i64).saturating_add(offset).max(0) as u64
    }

    /// Move ledger time forward
    pub fn advance_time(&self, secs: u64) {
        self.time_offset
            .fetch_add(secs.min(i64::MAX as u64) as i64, Ordering::SeqCst);
    }

    pub async fn block_number(&self) -> u64 {
        self.state.lock().await.block_number
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.read().await.subscribe()
    }

    /// Close every live subscription; later subscribers get a fresh channel
    pub async fn disconnect_subscribers(&self) {
        let (event_tx, _) = broadcast::channel(self.event_capacity);
        *self.events.write().await = event_tx;
        warn!("Source ledger {} dropped all event subscribers", self.chain);
    }

    /// Committed events strictly after `cursor`, in log order
    pub async fn events_since(&self, cursor: Option<Cursor>) -> Vec<EventEnvelope> {
        let state = self.state.lock().await;
        match cursor {
            None => state.log.clone(),
            Some(cursor) => state
                .log
                .iter()
                .filter(|e| e.cursor() > cursor)
                .cloned()
                .collect(),
        }
    }

    // Token entrypoints

    pub async fn mint(&self, asset: Address, to: Address, amount: u128) -> BridgeResult<()> {
        self.state.lock().await.tokens.mint(asset, to, amount)
    }

    pub async fn approve(&self, asset: Address, owner: Address, spender: Address, amount: u128) {
        self.state
            .lock()
            .await
            .tokens
            .approve(asset, owner, spender, amount);
    }

    pub async fn balance_of(&self, asset: Address, owner: Address) -> u128 {
        self.state.lock().await.tokens.balance_of(asset, owner)
    }

    pub async fn allowance(&self, asset: Address, owner: Address, spender: Address) -> u128 {
        self.state
            .lock()
            .await
            .tokens
            .allowance(asset, owner, spender)
    }

    // Lock Store entrypoints

    pub async fn add_supported_asset(
        &self,
        caller: Address,
        asset: Address,
    ) -> BridgeResult<EventEnvelope> {
        let mut state = self.state.lock().await;
        let event = state.lock_store.add_supported_asset(caller, asset)?;
        self.commit_one(&mut state, event).await
    }

    pub async fn remove_supported_asset(
        &self,
        caller: Address,
        asset: Address,
    ) -> BridgeResult<EventEnvelope> {
        let mut state = self.state.lock().await;
        let event = state.lock_store.remove_supported_asset(caller, asset)?;
        self.commit_one(&mut state, event).await
    }

    pub async fn lock(
        &self,
        caller: Address,
        intent_id: &IntentId,
        asset: Address,
        from: Address,
        amount: u128,
        receiver_hint: &str,
    ) -> BridgeResult<EventEnvelope> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let LedgerState {
            tokens, lock_store, ..
        } = &mut *state;
        let event = lock_store.lock(
            tokens,
            caller,
            intent_id,
            asset,
            from,
            amount,
            receiver_hint,
            now,
        )?;
        crate::metrics::record_locked_amount(asset, lock_store.locked_amount(asset));
        self.commit_one(&mut state, event).await
    }

    pub async fn unlock(
        &self,
        caller: Address,
        intent_id: &IntentId,
        asset: Address,
        to: Address,
        amount: u128,
    ) -> BridgeResult<EventEnvelope> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let LedgerState {
            tokens, lock_store, ..
        } = &mut *state;
        let event = lock_store.unlock(tokens, caller, intent_id, asset, to, amount, now)?;
        crate::metrics::record_locked_amount(asset, lock_store.locked_amount(asset));
        self.commit_one(&mut state, event).await
    }

    pub async fn locked_amount(&self, asset: Address) -> u128 {
        self.state.lock().await.lock_store.locked_amount(asset)
    }

    pub async fn is_supported(&self, asset: Address) -> bool {
        self.state.lock().await.lock_store.is_supported(asset)
    }

    // Intent Registry entrypoints

    #[allow(clippy::too_many_arguments)]
    pub async fn create_intent(
        &self,
        caller: Address,
        id: IntentId,
        receiver: String,
        asset: Address,
        amount: u128,
        expiration: u64,
    ) -> BridgeResult<EventEnvelope> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let LedgerState {
            tokens, registry, ..
        } = &mut *state;
        let event = registry.create_intent(
            tokens,
            caller,
            id,
            receiver,
            asset,
            amount,
            expiration,
            now,
        )?;
        self.commit_one(&mut state, event).await
    }

    pub async fn update_status(
        &self,
        caller: Address,
        id: &IntentId,
        status: IntentStatus,
    ) -> BridgeResult<EventEnvelope> {
        let mut state = self.state.lock().await;
        let event = state.registry.update_status(caller, id, status)?;
        self.commit_one(&mut state, event).await
    }

    /// Execute a Pending intent: take custody of its asset and mark it executed
    ///
    /// Emits, in order: status Relaying, `Locked`, status Completed and
    /// `IntentExecuted`. If custody cannot be taken nothing is committed.
    pub async fn execute_intent(
        &self,
        caller: Address,
        id: &IntentId,
    ) -> BridgeResult<Vec<EventEnvelope>> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let LedgerState {
            tokens,
            lock_store,
            registry,
            ..
        } = &mut *state;

        let intent = registry.check_executable(caller, id, now)?.clone();
        let locked = lock_store.take_custody(
            tokens,
            registry.address(),
            id,
            intent.asset,
            intent.sender,
            intent.amount,
            &intent.receiver,
            now,
        )?;
        let (relaying, completed) = registry.record_execution(id)?;
        crate::metrics::record_locked_amount(intent.asset, lock_store.locked_amount(intent.asset));

        let mut events = vec![relaying, locked];
        events.extend(completed);
        Ok(self.commit(&mut state, events).await)
    }

    pub async fn update_operator(
        &self,
        caller: Address,
        new_operator: Address,
    ) -> BridgeResult<EventEnvelope> {
        let mut state = self.state.lock().await;
        let event = state.registry.update_operator(caller, new_operator)?;
        self.commit_one(&mut state, event).await
    }

    pub async fn get_intent(&self, id: &IntentId) -> Option<Intent> {
        self.state.lock().await.registry.get_intent(id).cloned()
    }

    pub async fn lock_store_address(&self) -> Address {
        self.state.lock().await.lock_store.address()
    }

    pub async fn registry_address(&self) -> Address {
        self.state.lock().await.registry.address()
    }

    async fn commit_one(
        &self,
        state: &mut LedgerState,
        event: LedgerEvent,
    ) -> BridgeResult<EventEnvelope> {
        self.commit(state, vec![event])
            .await
            .pop()
            .ok_or_else(|| BridgeError::Internal("commit produced no envelope".to_string()))
    }

    /// Seal `events` into a new block, append them to the log and broadcast
    async fn commit(
        &self,
        state: &mut LedgerState,
        events: Vec<LedgerEvent>,
    ) -> Vec<EventEnvelope> {
        state.block_number += 1;
        let block_number = state.block_number;
        let tx_hash = transaction_hash(block_number, &events);

        let envelopes: Vec<EventEnvelope> = events
            .into_iter()
            .enumerate()
            .map(|(log_index, event)| EventEnvelope {
                block_number,
                log_index: log_index as u32,
                tx_hash,
                event,
            })
            .collect();

        state.log.extend(envelopes.iter().cloned());

        let event_tx = self.events.read().await;
        for envelope in &envelopes {
            debug!(
                "Block {} log {}: {} {:?}",
                block_number,
                envelope.log_index,
                envelope.event.name(),
                envelope.event.intent_id()
            );
            // No subscribers is fine; the log keeps the event for replay.
            let _ = event_tx.send(envelope.clone());
        }
        envelopes
    }
}

fn transaction_hash(block_number: u64, events: &[LedgerEvent]) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(block_number.to_be_bytes());
    for event in events {
        hasher.update(event.name().as_bytes());
        if let Some(id) = event.intent_id() {
            hasher.update(id.as_bytes());
        }
    }
    B256::from_slice(&hasher.finalize())
}
