//! Orchestrator - drives each transfer through the source ledger and relayer
//!
//! This module provides:
//! - Request validation and intent registration
//! - A per-transfer pipeline: execute on the source, wait for the observed
//!   lock, then wait for the relayer's outcome
//! - Restart recovery and operator reconciliation of orphaned locks

pub mod correlator;

pub use correlator::{Correlator, Waiter};

use crate::config::{OrchestratorConfig, SourceConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventEnvelope, LedgerEvent};
use crate::ledger::{IntentStatus, SourceLedger};
use crate::relayer::RelayOutcome;
use crate::state::{RelayState, StateManager, TransferRecord, TransferStatus};
use crate::types::{is_valid_account_id, IntentId};

use alloy_primitives::Address;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// A caller's transfer request
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source_chain: String,
    pub target_chain: String,
    /// Source asset address as text
    pub token: String,
    pub amount: u128,
    pub receiver: String,
    /// Intent sender; the configured default sender when absent
    pub sender: Option<Address>,
}

/// Transfer record joined with the registry's view of the intent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferView {
    #[serde(flatten)]
    pub transfer: TransferRecord,
    pub registry_status: Option<IntentStatus>,
    pub relay_state: Option<RelayState>,
}

pub struct Orchestrator {
    ledger: Arc<SourceLedger>,
    state_manager: Arc<StateManager>,
    /// Source block of each observed `Locked` event
    locks: Correlator<u64>,
    relays: Correlator<RelayOutcome>,
    config: OrchestratorConfig,
    target_chain: String,
    operator: Address,
    default_sender: Address,
    intent_ttl_secs: u64,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<SourceLedger>,
        state_manager: Arc<StateManager>,
        config: OrchestratorConfig,
        source: &SourceConfig,
        target_chain: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            state_manager,
            locks: Correlator::new(),
            relays: Correlator::new(),
            config,
            target_chain: target_chain.into(),
            operator: source.operator,
            default_sender: source.default_sender,
            intent_ttl_secs: source.intent_ttl_secs,
        }
    }

    /// Register the transfer and start its pipeline in the background
    pub async fn submit(self: &Arc<Self>, request: TransferRequest) -> BridgeResult<IntentId> {
        let id = self.register(request).await?;

        let orchestrator = self.clone();
        let pipeline_id = id.clone();
        tokio::spawn(async move {
            orchestrator.process(&pipeline_id).await;
        });

        Ok(id)
    }

    /// Validate the request, persist it as Pending and create the source intent
    pub async fn register(&self, request: TransferRequest) -> BridgeResult<IntentId> {
        let asset = self.validate(&request).await?;
        let sender = request.sender.unwrap_or(self.default_sender);

        let id = IntentId::generate();
        let record = TransferRecord::new(
            id.clone(),
            self.ledger.chain(),
            &request.target_chain,
            sender,
            asset,
            request.amount,
            &request.receiver,
        );
        self.state_manager.insert_transfer(&record).await?;

        let expiration = self.ledger.now() + self.intent_ttl_secs;
        if let Err(e) = self
            .ledger
            .create_intent(
                sender,
                id.clone(),
                request.receiver.clone(),
                asset,
                request.amount,
                expiration,
            )
            .await
        {
            warn!("Registering intent {} failed: {}", id, e);
            self.record_failure(&id, &e).await;
            return Err(e);
        }

        crate::metrics::record_intent_created();
        info!(
            "Registered intent {}: {} of {} for {} on {}",
            id, request.amount, asset, request.receiver, request.target_chain
        );
        Ok(id)
    }

    async fn validate(&self, request: &TransferRequest) -> BridgeResult<Address> {
        if !request.source_chain.eq_ignore_ascii_case(self.ledger.chain())
            || !request.target_chain.eq_ignore_ascii_case(&self.target_chain)
            || !self
                .config
                .supports_route(&request.source_chain, &request.target_chain)
        {
            return Err(BridgeError::InvalidRequest(format!(
                "unsupported route {} -> {}",
                request.source_chain, request.target_chain
            )));
        }

        let asset = Address::from_str(request.token.trim()).map_err(|_| {
            BridgeError::InvalidRequest(format!("token {} is not a valid address", request.token))
        })?;
        if !self.ledger.is_supported(asset).await {
            return Err(BridgeError::InvalidRequest(format!(
                "token {} is not supported",
                asset
            )));
        }
        if request.amount == 0 {
            return Err(BridgeError::InvalidRequest(
                "amount must be greater than zero".to_string(),
            ));
        }
        if !is_valid_account_id(&request.receiver) {
            return Err(BridgeError::InvalidRequest(format!(
                "receiver {:?} is not a valid account id",
                request.receiver
            )));
        }
        Ok(asset)
    }

    /// Run the pipeline for a registered transfer; failures are recorded, not returned
    pub async fn process(&self, id: &IntentId) {
        if let Err(e) = self.drive(id).await {
            if e.should_alert() {
                error!("Transfer {} failed: {}", id, e);
            } else {
                warn!("Transfer {} failed: {}", id, e);
            }
            self.record_failure(id, &e).await;
        }
        self.locks.forget(id);
        self.relays.forget(id);
    }

    async fn drive(&self, id: &IntentId) -> BridgeResult<()> {
        self.state_manager
            .transition(id, TransferStatus::Processing, None)
            .await?;

        // Armed before the trigger so a fast observation cannot be missed
        let lock_waiter = self.locks.arm(id);
        let relay_waiter = self.relays.arm(id);

        self.ledger.execute_intent(self.operator, id).await?;
        debug!("Executed intent {} on {}", id, self.ledger.chain());

        let block = lock_waiter
            .wait(self.config.lock_timeout(), "lock observation")
            .await?;
        self.state_manager
            .update_transfer(id, |record| {
                record.lock_block = Some(block);
                Ok(())
            })
            .await?;
        info!("Lock for {} observed in block {}", id, block);

        let outcome = relay_waiter
            .wait(self.config.relay_timeout(), "relay outcome")
            .await?;
        if outcome.state.is_delivered() {
            self.state_manager
                .transition(id, TransferStatus::Completed, None)
                .await?;
            crate::metrics::record_transfer_completed();
            info!("Transfer {} completed ({})", id, outcome.state);
            Ok(())
        } else {
            Err(BridgeError::DeadLetter {
                intent_id: id.clone(),
                message: outcome
                    .error
                    .unwrap_or_else(|| format!("relay ended {}", outcome.state)),
            })
        }
    }

    async fn record_failure(&self, id: &IntentId, cause: &BridgeError) {
        crate::metrics::record_transfer_failed(failure_reason(cause));

        if let Err(e) = self
            .state_manager
            .transition(id, TransferStatus::Failed, Some(cause.to_string()))
            .await
        {
            error!("Could not record failure of {}: {}", id, e);
        }

        // Best effort: mirror onto the registry while it can still move
        let status = match cause {
            BridgeError::Expired { .. } => IntentStatus::Expired,
            _ => IntentStatus::Failed,
        };
        if let Some(intent) = self.ledger.get_intent(id).await {
            if !intent.status.is_terminal() {
                if let Err(e) = self.ledger.update_status(self.operator, id, status).await {
                    warn!("Could not mark intent {} {} on the registry: {}", id, status, e);
                }
            }
        }
    }

    /// Route source events and relay outcomes to waiting pipelines
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<EventEnvelope>,
        mut outcomes: broadcast::Receiver<RelayOutcome>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BridgeResult<()> {
        info!("Orchestrator started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = events.recv() => match received {
                    Ok(envelope) => self.observe_event(&envelope),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Orchestrator missed {} source event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                received = outcomes.recv() => match received {
                    Ok(outcome) => self.observe_outcome(outcome),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Orchestrator missed {} relay outcome(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    pub fn observe_event(&self, envelope: &EventEnvelope) {
        if let LedgerEvent::Locked { intent_id, .. } = &envelope.event {
            if self.locks.resolve(intent_id, envelope.block_number) {
                debug!("Resolved lock wait for {}", intent_id);
            }
        }
    }

    pub fn observe_outcome(&self, outcome: RelayOutcome) {
        let id = outcome.intent_id.clone();
        if self.relays.resolve(&id, outcome) {
            debug!("Resolved relay wait for {}", id);
        }
    }

    pub async fn get_transfer(&self, id: &IntentId) -> BridgeResult<Option<TransferRecord>> {
        self.state_manager.get_transfer(id).await
    }

    pub async fn get_transfer_view(&self, id: &IntentId) -> BridgeResult<Option<TransferView>> {
        let Some(transfer) = self.state_manager.get_transfer(id).await? else {
            return Ok(None);
        };
        let registry_status = self.ledger.get_intent(id).await.map(|intent| intent.status);
        let relay_state = self
            .state_manager
            .get_relay(id)
            .await?
            .map(|relay| relay.state);

        Ok(Some(TransferView {
            transfer,
            registry_status,
            relay_state,
        }))
    }

    /// Failed transfers whose asset is still held by the Lock Store
    pub async fn orphaned_locks(&self) -> BridgeResult<Vec<TransferRecord>> {
        let mut orphans = Vec::new();
        for record in self
            .state_manager
            .transfers_in_status(TransferStatus::Failed)
            .await?
        {
            if record.refunded || !self.custody_taken(&record.id).await {
                continue;
            }
            let delivered = self
                .state_manager
                .get_relay(&record.id)
                .await?
                .map(|relay| relay.state.is_delivered())
                .unwrap_or(false);
            if !delivered {
                orphans.push(record);
            }
        }
        Ok(orphans)
    }

    /// Release an orphaned lock back to the intent's sender
    pub async fn refund(&self, id: &IntentId) -> BridgeResult<TransferRecord> {
        let record = self
            .state_manager
            .get_transfer(id)
            .await?
            .ok_or_else(|| BridgeError::IntentNotFound(id.clone()))?;

        if record.status != TransferStatus::Failed || record.refunded {
            return Err(BridgeError::InvalidStateTransition {
                from: record.status.to_string(),
                to: "refunded".to_string(),
            });
        }
        if !self.custody_taken(id).await {
            return Err(BridgeError::InvalidRequest(format!(
                "intent {} never locked any funds",
                id
            )));
        }
        match self.state_manager.get_relay(id).await?.map(|r| r.state) {
            Some(state) if state.is_delivered() => {
                return Err(BridgeError::AlreadyExecuted(id.clone()));
            }
            Some(RelayState::InFlight) => {
                return Err(BridgeError::InvalidStateTransition {
                    from: RelayState::InFlight.to_string(),
                    to: "refunded".to_string(),
                });
            }
            _ => {}
        }

        self.ledger
            .unlock(self.operator, id, record.token, record.sender, record.amount)
            .await?;
        let record = self
            .state_manager
            .update_transfer(id, |record| {
                record.refunded = true;
                Ok(())
            })
            .await?;

        info!(
            "Refunded {} of {} to {} for intent {}",
            record.amount, record.token, record.sender, id
        );
        Ok(record)
    }

    /// Resolve transfers left non-terminal by a previous process
    pub async fn recover_interrupted(&self) -> BridgeResult<usize> {
        let mut interrupted = self
            .state_manager
            .transfers_in_status(TransferStatus::Pending)
            .await?;
        interrupted.extend(
            self.state_manager
                .transfers_in_status(TransferStatus::Processing)
                .await?,
        );

        for record in &interrupted {
            let relay = self.state_manager.get_relay(&record.id).await?;
            match relay {
                Some(relay) if relay.state.is_delivered() => {
                    self.state_manager
                        .transition(&record.id, TransferStatus::Completed, None)
                        .await?;
                    info!("Recovered transfer {} as completed", record.id);
                }
                _ => {
                    let cause = BridgeError::Internal(
                        "interrupted by restart; reconcile before retrying".to_string(),
                    );
                    warn!("Recovered transfer {} as failed", record.id);
                    self.record_failure(&record.id, &cause).await;
                }
            }
        }

        if !interrupted.is_empty() {
            info!("Recovered {} interrupted transfer(s)", interrupted.len());
        }
        Ok(interrupted.len())
    }

    async fn custody_taken(&self, id: &IntentId) -> bool {
        self.ledger
            .get_intent(id)
            .await
            .map(|intent| intent.executed)
            .unwrap_or(false)
    }
}

fn failure_reason(cause: &BridgeError) -> &'static str {
    match cause {
        BridgeError::Timeout { .. } => "timeout",
        BridgeError::DeadLetter { .. } => "dead_letter",
        BridgeError::Expired { .. } => "expired",
        _ => match cause.kind() {
            crate::error::ErrorKind::InsufficientFunds => "insufficient_funds",
            crate::error::ErrorKind::Unauthorized => "unauthorized",
            _ => "error",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::Settings;
    use crate::ledger::tests::{ASSET, OPERATOR, SENDER};
    use std::time::Duration;

    struct Harness {
        ledger: Arc<SourceLedger>,
        state: Arc<StateManager>,
        orchestrator: Arc<Orchestrator>,
    }

    async fn harness() -> Harness {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let ledger = Arc::new(SourceLedger::from_config(&settings.source).await.unwrap());
        let state = Arc::new(StateManager::in_memory().await.unwrap());
        let orchestrator = Arc::new(Orchestrator::new(
            ledger.clone(),
            state.clone(),
            settings.orchestrator.clone(),
            &settings.source,
            settings.destination.chain.clone(),
        ));
        Harness {
            ledger,
            state,
            orchestrator,
        }
    }

    fn request(amount: u128) -> TransferRequest {
        TransferRequest {
            source_chain: "ethereum".to_string(),
            target_chain: "near".to_string(),
            token: ASSET.to_string(),
            amount,
            receiver: "alice.testnet".to_string(),
            sender: None,
        }
    }

    fn delivered(id: &IntentId) -> RelayOutcome {
        RelayOutcome {
            intent_id: id.clone(),
            state: RelayState::Delivered,
            attempts: 1,
            destination_tx: None,
            error: None,
        }
    }

    /// Feed the orchestrator every `Locked` event the ledger has committed
    async fn feed_locks(h: &Harness) {
        for envelope in h.ledger.events_since(None).await {
            h.orchestrator.observe_event(&envelope);
        }
    }

    #[tokio::test]
    async fn test_invalid_requests_register_nothing() {
        let h = harness().await;

        let mut bad_route = request(10);
        bad_route.target_chain = "solana".to_string();
        let mut bad_token = request(10);
        bad_token.token = "not-an-address".to_string();
        let mut unsupported = request(10);
        unsupported.token = Address::repeat_byte(0xbb).to_string();
        let mut bad_receiver = request(10);
        bad_receiver.receiver = String::new();

        for req in [bad_route, bad_token, unsupported, request(0), bad_receiver] {
            let err = h.orchestrator.register(req).await.unwrap_err();
            assert!(matches!(err, BridgeError::InvalidRequest(_)), "{}", err);
        }
        assert_eq!(h.state.get_stats().await.unwrap(), Default::default());
    }

    #[tokio::test]
    async fn test_register_creates_pending_intent() {
        let h = harness().await;
        let id = h.orchestrator.register(request(250)).await.unwrap();

        let intent = h.ledger.get_intent(&id).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);
        assert_eq!(intent.sender, SENDER);
        assert_eq!(intent.amount, 250);

        let record = h.orchestrator.get_transfer(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.source_chain, "ethereum");
    }

    #[tokio::test]
    async fn test_unauthorized_amount_fails_registration() {
        let h = harness().await;
        let err = h.orchestrator.register(request(5_000_000)).await.unwrap_err();
        assert!(matches!(err, BridgeError::InsufficientAuthorization { .. }));

        let stats = h.state.get_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_pipeline_completes_on_delivery() {
        let h = harness().await;
        let id = h.orchestrator.register(request(100)).await.unwrap();

        let pipeline = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            let id = id.clone();
            async move { orchestrator.process(&id).await }
        });

        // Wait for custody, then play the listener and relayer
        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.orchestrator.custody_taken(&id).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        feed_locks(&h).await;
        h.orchestrator.observe_outcome(delivered(&id));
        pipeline.await.unwrap();

        let record = h.orchestrator.get_transfer(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert!(record.lock_block.is_some());
        assert_eq!(h.ledger.locked_amount(ASSET).await, 100);
        assert!(h.orchestrator.orphaned_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_fails_transfer() {
        let h = harness().await;
        let id = h.orchestrator.register(request(100)).await.unwrap();

        let pipeline = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            let id = id.clone();
            async move { orchestrator.process(&id).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.orchestrator.custody_taken(&id).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        feed_locks(&h).await;
        h.orchestrator.observe_outcome(RelayOutcome {
            intent_id: id.clone(),
            state: RelayState::DeadLetter,
            attempts: 3,
            destination_tx: None,
            error: Some("proof rejected".to_string()),
        });
        pipeline.await.unwrap();

        let record = h.orchestrator.get_transfer(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert!(record.error.unwrap().contains("proof rejected"));

        let orphans = h.orchestrator.orphaned_locks().await.unwrap();
        assert_eq!(orphans.len(), 1);

        let before = h.ledger.balance_of(ASSET, SENDER).await;
        let refunded = h.orchestrator.refund(&id).await.unwrap();
        assert!(refunded.refunded);
        assert_eq!(h.ledger.balance_of(ASSET, SENDER).await, before + 100);
        assert_eq!(h.ledger.locked_amount(ASSET).await, 0);

        // A second refund is rejected and moves nothing
        assert!(h.orchestrator.refund(&id).await.is_err());
        assert!(h.orchestrator.orphaned_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_intent_is_mirrored_expired() {
        let h = harness().await;
        let id = h.orchestrator.register(request(100)).await.unwrap();
        h.ledger.advance_time(7_200);

        h.orchestrator.process(&id).await;

        let record = h.orchestrator.get_transfer(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert!(record.error.unwrap().contains("expired"));
        let intent = h.ledger.get_intent(&id).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Expired);
        assert!(!intent.executed);

        // Nothing was locked, so there is nothing to refund
        assert!(h.orchestrator.orphaned_locks().await.unwrap().is_empty());
        assert!(matches!(
            h.orchestrator.refund(&id).await,
            Err(BridgeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_transfers() {
        let h = harness().await;
        let done = h.orchestrator.register(request(10)).await.unwrap();
        let stuck = h.orchestrator.register(request(10)).await.unwrap();

        let mut relay = crate::state::RelayRecord::in_flight(done.clone());
        relay.state = RelayState::Duplicate;
        h.state.upsert_relay(&relay).await.unwrap();

        assert_eq!(h.orchestrator.recover_interrupted().await.unwrap(), 2);
        let done = h.orchestrator.get_transfer(&done).await.unwrap().unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        let stuck_record = h.orchestrator.get_transfer(&stuck).await.unwrap().unwrap();
        assert_eq!(stuck_record.status, TransferStatus::Failed);
        assert_eq!(
            h.ledger.get_intent(&stuck).await.unwrap().status,
            IntentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_transfer_view_joins_registry_status() {
        let h = harness().await;
        let id = h.orchestrator.register(request(10)).await.unwrap();
        h.ledger.execute_intent(OPERATOR, &id).await.unwrap();

        let view = h.orchestrator.get_transfer_view(&id).await.unwrap().unwrap();
        assert_eq!(view.registry_status, Some(IntentStatus::Completed));
        assert_eq!(view.relay_state, None);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["registryStatus"], "completed");
        assert!(h
            .orchestrator
            .get_transfer_view(&IntentId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }
}
