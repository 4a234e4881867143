//! Relayer: turns observed `Locked` events into destination executions
//!
//! One event loop consumes the listener's stream for the life of the process.
//! Each newly seen lock is handled on its own task, bounded by a semaphore:
//! attest a proof, submit through the transaction sender, persist the outcome
//! and publish it to subscribers keyed by intent id.

use crate::destination::{DestinationLedger, ExecutionRequest, TxOutcome};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventEnvelope, LedgerEvent};
use crate::proof::{content_hash, ProofSigner};
use crate::state::{RelayRecord, RelayState, StateManager};
use crate::tx::TransactionSender;
use crate::types::IntentId;

use alloy_primitives::B256;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Terminal result of relaying one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayOutcome {
    pub intent_id: IntentId,
    pub state: RelayState,
    pub attempts: u32,
    pub destination_tx: Option<B256>,
    pub error: Option<String>,
}

pub struct Relayer {
    destination: Arc<dyn DestinationLedger>,
    sender: TransactionSender,
    signer: ProofSigner,
    state_manager: Arc<StateManager>,
    /// Intents handled by this process, with their latest state
    seen: DashMap<IntentId, RelayState>,
    outcome_tx: broadcast::Sender<RelayOutcome>,
    permits: Arc<Semaphore>,
}

impl Relayer {
    pub fn new(
        destination: Arc<dyn DestinationLedger>,
        sender: TransactionSender,
        signer: ProofSigner,
        state_manager: Arc<StateManager>,
        max_concurrent: usize,
    ) -> Self {
        let (outcome_tx, _) = broadcast::channel(1024);
        Self {
            destination,
            sender,
            signer,
            state_manager,
            seen: DashMap::new(),
            outcome_tx,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<RelayOutcome> {
        self.outcome_tx.subscribe()
    }

    /// Reload persisted relays; terminal ones are never submitted again
    ///
    /// Relays left in flight by a previous process stay unclaimed so a replayed
    /// `Locked` event resubmits them; the destination deduplicates.
    pub async fn restore(&self) -> BridgeResult<usize> {
        let mut restored = 0;
        for record in self.state_manager.all_relays().await? {
            if record.state.is_terminal() {
                self.seen.insert(record.intent_id, record.state);
                restored += 1;
            }
        }
        info!("Restored {} terminal relay(s)", restored);
        Ok(restored)
    }

    /// Consume the source event stream until shutdown or stream end
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<EventEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BridgeResult<()> {
        info!(
            "Relayer started: signing as {} towards {}",
            self.sender.signer(),
            self.destination.chain()
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = events.recv() => match received {
                    Ok(envelope) => {
                        if !self.claim(&envelope) {
                            continue;
                        }
                        let permit = self
                            .permits
                            .clone()
                            .acquire_owned()
                            .await
                            .map_err(|e| {
                                BridgeError::Internal(format!("relay permits closed: {}", e))
                            })?;
                        let relayer = self.clone();
                        tokio::spawn(async move {
                            relayer.relay(&envelope).await;
                            drop(permit);
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        error!("Relayer lagged behind the listener by {} event(s)", skipped);
                    }
                    Err(RecvError::Closed) => {
                        warn!("Event stream closed, relayer stopping");
                        break;
                    }
                },
            }
        }

        info!("Relayer stopped");
        Ok(())
    }

    /// Handle one event inline; `None` unless it started a new relay
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Option<RelayOutcome> {
        if !self.claim(envelope) {
            return None;
        }
        Some(self.relay(envelope).await)
    }

    /// Claim a `Locked` event for relay; repeats of a seen intent are suppressed
    fn claim(&self, envelope: &EventEnvelope) -> bool {
        let LedgerEvent::Locked { intent_id, .. } = &envelope.event else {
            return false;
        };

        match self.seen.entry(intent_id.clone()) {
            Entry::Occupied(entry) => {
                debug!(
                    "Suppressing repeated lock for {} (already {})",
                    intent_id,
                    entry.get()
                );
                crate::metrics::record_duplicate_suppressed();
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(RelayState::InFlight);
                true
            }
        }
    }

    async fn relay(&self, envelope: &EventEnvelope) -> RelayOutcome {
        let chain = self.destination.chain();
        let started = Instant::now();

        let outcome = match self.build_request(envelope) {
            Ok(request) => self.deliver(&request).await,
            Err(e) => RelayOutcome {
                intent_id: envelope
                    .event
                    .intent_id()
                    .cloned()
                    .unwrap_or_else(|| IntentId::from("")),
                state: RelayState::DeadLetter,
                attempts: 0,
                destination_tx: None,
                error: Some(e.to_string()),
            },
        };

        crate::metrics::record_relay_submission(&chain, outcome.state.as_str());
        crate::metrics::record_relay_latency(&chain, started.elapsed().as_secs_f64());

        let record = RelayRecord {
            intent_id: outcome.intent_id.clone(),
            state: outcome.state,
            attempts: outcome.attempts,
            destination_tx: outcome.destination_tx,
            last_error: outcome.error.clone(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.state_manager.upsert_relay(&record).await {
            error!("Failed to persist relay for {}: {}", outcome.intent_id, e);
        }
        self.seen.insert(outcome.intent_id.clone(), outcome.state);

        // No subscribers is fine
        let _ = self.outcome_tx.send(outcome.clone());
        outcome
    }

    async fn deliver(&self, request: &ExecutionRequest) -> RelayOutcome {
        let id = request.intent_id.clone();
        info!(
            "Relaying intent {}: {} of {} to {}",
            id, request.amount, request.asset, request.receiver
        );

        if let Err(e) = self
            .state_manager
            .upsert_relay(&RelayRecord::in_flight(id.clone()))
            .await
        {
            warn!("Failed to persist in-flight relay for {}: {}", id, e);
        }

        match self.sender.submit(request).await {
            Ok(submission) => {
                let state = match submission.outcome {
                    TxOutcome::Executed { .. } => RelayState::Delivered,
                    TxOutcome::Duplicate { .. } => RelayState::Duplicate,
                };
                info!("Intent {} {} by {}", id, state, submission.outcome.tx_hash());
                RelayOutcome {
                    intent_id: id,
                    state,
                    attempts: submission.attempts,
                    destination_tx: Some(submission.outcome.tx_hash()),
                    error: None,
                }
            }
            Err(e) => {
                let attempts = match &e {
                    BridgeError::RelayAborted { attempts, .. } => *attempts,
                    _ => 0,
                };
                error!("Intent {} dead-lettered: {}", id, e);
                RelayOutcome {
                    intent_id: id,
                    state: RelayState::DeadLetter,
                    attempts,
                    destination_tx: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn build_request(&self, envelope: &EventEnvelope) -> BridgeResult<ExecutionRequest> {
        let LedgerEvent::Locked {
            intent_id,
            asset,
            from,
            receiver_hint,
            amount,
            timestamp,
        } = &envelope.event
        else {
            return Err(BridgeError::EventStream(format!(
                "{} is not a lock event",
                envelope.event.name()
            )));
        };

        let hash = content_hash(*asset, *from, receiver_hint, *amount, *timestamp);
        let proof = self
            .signer
            .sign(intent_id.clone(), hash, envelope.block_number, *timestamp);

        Ok(ExecutionRequest {
            intent_id: intent_id.clone(),
            asset: *asset,
            sender: *from,
            receiver: receiver_hint.clone(),
            amount: *amount,
            timestamp: *timestamp,
            proof,
        })
    }
}
