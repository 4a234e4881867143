//! Chain event listener with cursor replay and reconnect backoff

use super::EventSource;
use crate::config::RelayerConfig;
use crate::error::BridgeResult;
use crate::events::{Cursor, EventEnvelope};
use crate::state::StateManager;
use crate::types::{backoff_delay, IntentId};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// How often the settled position is re-evaluated without new events
    pub checkpoint_interval: Duration,
    /// Capacity of the listener's own broadcast channel
    pub capacity: usize,
}

impl From<&RelayerConfig> for ListenerConfig {
    fn from(config: &RelayerConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(config.max_reconnect_delay_ms),
            checkpoint_interval: Duration::from_millis(config.checkpoint_interval_ms),
            capacity: 1024,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    /// Last forwarded event position
    forwarded: Option<Cursor>,
    /// Forwarded locks whose relay has no terminal record yet, each with the
    /// position forwarded just before it
    unsettled: BTreeMap<Cursor, (IntentId, Option<Cursor>)>,
    /// Last persisted checkpoint
    saved: Option<Cursor>,
}

/// Follows a source ledger and re-broadcasts each committed event exactly once
///
/// The persisted checkpoint never passes a `Locked` event until the relayer has
/// recorded a terminal outcome for it, so a restart replays unfinished relays.
pub struct ChainListener {
    source: Arc<dyn EventSource>,
    /// Checkpoint persistence and relay lookups
    state_manager: Arc<StateManager>,
    event_tx: broadcast::Sender<EventEnvelope>,
    progress: Mutex<Progress>,
    config: ListenerConfig,
}

impl ChainListener {
    /// Create a listener resuming from the persisted checkpoint
    ///
    /// A checkpoint taken from another event log, or past the source's head,
    /// is discarded and the whole log is replayed.
    pub async fn new(
        source: Arc<dyn EventSource>,
        state_manager: Arc<StateManager>,
        config: ListenerConfig,
    ) -> BridgeResult<Self> {
        let chain = source.name();
        let mut cursor = None;

        if let Some(checkpoint) = state_manager.get_checkpoint(&chain).await? {
            let head = source.health_check().await?;
            if checkpoint.source_instance != source.instance() {
                warn!(
                    "Checkpoint for {} belongs to another event log, replaying from genesis",
                    chain
                );
            } else if checkpoint.cursor.0 > head {
                warn!(
                    "Checkpoint {:?} for {} is past block {}, replaying from genesis",
                    checkpoint.cursor, chain, head
                );
            } else {
                info!("Listener for {} resuming after {:?}", chain, checkpoint.cursor);
                cursor = Some(checkpoint.cursor);
            }
        }
        let (event_tx, _) = broadcast::channel(config.capacity);

        Ok(Self {
            source,
            state_manager,
            event_tx,
            progress: Mutex::new(Progress {
                forwarded: cursor,
                saved: cursor,
                ..Progress::default()
            }),
            config,
        })
    }

    pub fn chain(&self) -> String {
        self.source.name()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }

    /// Last forwarded event position
    pub async fn cursor(&self) -> Option<Cursor> {
        self.progress.lock().await.forwarded
    }

    /// Number of forwarded locks still waiting on a terminal relay
    pub async fn unsettled(&self) -> usize {
        self.progress.lock().await.unsettled.len()
    }

    /// Main listening loop; returns once `shutdown` flips to true
    pub async fn listen(&self, mut shutdown: watch::Receiver<bool>) -> BridgeResult<()> {
        let chain = self.chain();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.follow(&mut shutdown).await {
                Ok(true) => break,
                Ok(false) => {
                    failures = 1;
                    warn!("Event stream for {} closed, reconnecting", chain);
                }
                Err(e) => {
                    failures += 1;
                    error!("Event stream for {} failed: {}", chain, e);
                }
            }
            self.commit_checkpoint().await;
            crate::metrics::record_chain_health(&chain, false);
            crate::metrics::record_listener_reconnect(&chain);

            let delay = backoff_delay(
                self.config.reconnect_delay,
                self.config.max_reconnect_delay,
                failures,
            );
            debug!("Reconnecting to {} in {:?}", chain, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.commit_checkpoint().await;
        info!("Listener for {} stopped", chain);
        Ok(())
    }

    /// Subscribe, replay the backlog, then stream live events
    ///
    /// Returns `Ok(true)` on shutdown and `Ok(false)` when the stream closed.
    async fn follow(&self, shutdown: &mut watch::Receiver<bool>) -> BridgeResult<bool> {
        let chain = self.chain();

        // Subscribe before reading the backlog so nothing falls in between.
        let mut rx = self.source.subscribe().await?;
        let backlog = self.source.events_since(self.cursor().await).await?;
        if !backlog.is_empty() {
            info!("Replaying {} event(s) from {}", backlog.len(), chain);
        }
        for envelope in backlog {
            self.forward(envelope).await;
        }
        crate::metrics::record_chain_health(&chain, true);

        let mut checkpoints = tokio::time::interval(self.config.checkpoint_interval);
        checkpoints.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(true);
                    }
                }
                _ = checkpoints.tick() => self.commit_checkpoint().await,
                received = rx.recv() => match received {
                    Ok(envelope) => self.forward(envelope).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Listener for {} lagged by {} event(s), catching up",
                            chain, skipped
                        );
                        for envelope in self.source.events_since(self.cursor().await).await? {
                            self.forward(envelope).await;
                        }
                    }
                    Err(RecvError::Closed) => return Ok(false),
                },
            }
        }
    }

    async fn forward(&self, envelope: EventEnvelope) {
        {
            let mut progress = self.progress.lock().await;
            if matches!(progress.forwarded, Some(seen) if envelope.cursor() <= seen) {
                return;
            }
            if envelope.event.requires_action() {
                if let Some(intent_id) = envelope.event.intent_id() {
                    let before = progress.forwarded;
                    progress
                        .unsettled
                        .insert(envelope.cursor(), (intent_id.clone(), before));
                }
            }
            progress.forwarded = Some(envelope.cursor());
        }

        let chain = self.chain();
        crate::metrics::record_event(&chain, &envelope.event);
        crate::metrics::record_block_observed(&chain, envelope.block_number);

        // No receivers is fine
        let _ = self.event_tx.send(envelope);

        self.commit_checkpoint().await;
    }

    /// Persist the furthest position with no unsettled lock at or before it
    pub async fn commit_checkpoint(&self) {
        let chain = self.chain();
        let mut progress = self.progress.lock().await;

        while let Some((at, (intent_id, _))) = progress.unsettled.first_key_value() {
            let (at, intent_id) = (*at, intent_id.clone());
            match self.state_manager.get_relay(&intent_id).await {
                Ok(Some(relay)) if relay.state.is_terminal() => {
                    debug!("Lock for {} at {:?} settled ({})", intent_id, at, relay.state);
                    progress.unsettled.remove(&at);
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("Failed to check relay of {}: {}", intent_id, e);
                    return;
                }
            }
        }

        let settled = match progress.unsettled.first_key_value() {
            Some((_, (_, before))) => *before,
            None => progress.forwarded,
        };
        let Some(settled) = settled else {
            return;
        };
        if progress.saved == Some(settled) {
            return;
        }

        match self
            .state_manager
            .save_checkpoint(&chain, &self.source.instance(), settled)
            .await
        {
            Ok(()) => progress.saved = Some(settled),
            Err(e) => warn!("Failed to save checkpoint for {}: {}", chain, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::{funded_ledger, ASSET, OPERATOR, SENDER};
    use crate::ledger::SourceLedger;
    use crate::state::{RelayRecord, RelayState};

    fn config() -> ListenerConfig {
        ListenerConfig {
            reconnect_delay: Duration::from_millis(5),
            max_reconnect_delay: Duration::from_millis(20),
            checkpoint_interval: Duration::from_millis(10),
            capacity: 64,
        }
    }

    async fn spawn_listener(
        ledger: &Arc<SourceLedger>,
        state: &Arc<StateManager>,
    ) -> (
        Arc<ChainListener>,
        broadcast::Receiver<EventEnvelope>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<BridgeResult<()>>,
    ) {
        let listener = Arc::new(
            ChainListener::new(ledger.clone(), state.clone(), config())
                .await
                .unwrap(),
        );
        let rx = listener.subscribe_events();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let listener = listener.clone();
            async move { listener.listen(shutdown_rx).await }
        });
        (listener, rx, shutdown_tx, task)
    }

    async fn settle(state: &StateManager, id: &str) {
        let mut relay = RelayRecord::in_flight(IntentId::from(id));
        relay.state = RelayState::Delivered;
        state.upsert_relay(&relay).await.unwrap();
    }

    async fn saved(state: &StateManager) -> Option<Cursor> {
        state
            .get_checkpoint("ethereum")
            .await
            .unwrap()
            .map(|checkpoint| checkpoint.cursor)
    }

    async fn create(ledger: &SourceLedger, id: &str) {
        let expiration = ledger.now() + 600;
        ledger
            .create_intent(SENDER, IntentId::from(id), "alice.near".into(), ASSET, 10, expiration)
            .await
            .unwrap();
    }

    async fn next(rx: &mut broadcast::Receiver<EventEnvelope>) -> EventEnvelope {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("listener stalled")
            .unwrap()
    }

    #[tokio::test]
    async fn test_replays_backlog_then_streams() {
        let ledger = Arc::new(funded_ledger(1_000).await);
        create(&ledger, "1").await;

        let state = Arc::new(StateManager::in_memory().await.unwrap());
        let (listener, mut rx, shutdown_tx, task) = spawn_listener(&ledger, &state).await;

        // Backlog: asset support change, then the intent creation
        assert_eq!(next(&mut rx).await.event.name(), "asset_support_changed");
        assert_eq!(next(&mut rx).await.event.name(), "intent_created");

        ledger.execute_intent(OPERATOR, &IntentId::from("1")).await.unwrap();
        let events = [
            next(&mut rx).await,
            next(&mut rx).await,
            next(&mut rx).await,
            next(&mut rx).await,
        ];
        let names: Vec<_> = events.iter().map(|e| e.event.name()).collect();
        assert_eq!(
            names,
            ["intent_status_updated", "locked", "intent_status_updated", "intent_executed"]
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // Nothing relayed the lock, so the checkpoint stops just before it
        assert_eq!(listener.cursor().await, Some(events[3].cursor()));
        assert_eq!(listener.unsettled().await, 1);
        assert_eq!(saved(&state).await, Some(events[0].cursor()));
    }

    #[tokio::test]
    async fn test_checkpoint_advances_once_relay_is_terminal() {
        let ledger = Arc::new(funded_ledger(1_000).await);
        let state = Arc::new(StateManager::in_memory().await.unwrap());
        let (listener, mut rx, shutdown_tx, task) = spawn_listener(&ledger, &state).await;
        assert_eq!(next(&mut rx).await.event.name(), "asset_support_changed");

        create(&ledger, "1").await;
        ledger.execute_intent(OPERATOR, &IntentId::from("1")).await.unwrap();
        let mut before_lock = None;
        loop {
            let envelope = next(&mut rx).await;
            if envelope.event.name() == "locked" {
                break;
            }
            before_lock = Some(envelope.cursor());
        }
        let last = loop {
            let envelope = next(&mut rx).await;
            if envelope.event.name() == "intent_executed" {
                break envelope.cursor();
            }
        };

        // An in-flight record is not enough
        state
            .upsert_relay(&RelayRecord::in_flight(IntentId::from("1")))
            .await
            .unwrap();
        listener.commit_checkpoint().await;
        assert_eq!(saved(&state).await, before_lock);

        settle(&state, "1").await;
        listener.commit_checkpoint().await;
        assert_eq!(saved(&state).await, Some(last));
        assert_eq!(listener.unsettled().await, 0);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_replays_unsettled_lock() {
        let ledger = Arc::new(funded_ledger(1_000).await);
        create(&ledger, "1").await;
        ledger.execute_intent(OPERATOR, &IntentId::from("1")).await.unwrap();
        let state = Arc::new(StateManager::in_memory().await.unwrap());

        let (_, mut rx, shutdown_tx, task) = spawn_listener(&ledger, &state).await;
        while next(&mut rx).await.event.name() != "intent_executed" {}
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // Same ledger, new process: the lock is forwarded again
        let (_, mut rx, shutdown_tx, task) = spawn_listener(&ledger, &state).await;
        let replayed = next(&mut rx).await;
        assert_eq!(replayed.event.name(), "locked");
        assert_eq!(replayed.event.intent_id(), Some(&IntentId::from("1")));
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_from_previous_ledger_is_ignored() {
        let state = Arc::new(StateManager::in_memory().await.unwrap());
        state.save_checkpoint("ethereum", "previous-run", (50, 0)).await.unwrap();

        let ledger = Arc::new(funded_ledger(1_000).await);
        let (listener, mut rx, shutdown_tx, task) = spawn_listener(&ledger, &state).await;
        assert_eq!(next(&mut rx).await.event.name(), "asset_support_changed");

        create(&ledger, "1").await;
        ledger.execute_intent(OPERATOR, &IntentId::from("1")).await.unwrap();
        assert!(ledger.block_number().await < 50);

        let mut names = Vec::new();
        while names.last() != Some(&"intent_executed") {
            names.push(next(&mut rx).await.event.name());
        }
        assert!(names.contains(&"locked"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        let checkpoint = state.get_checkpoint("ethereum").await.unwrap().unwrap();
        assert_eq!(checkpoint.source_instance, ledger.instance());
        assert!(checkpoint.cursor < (50, 0));
        assert!(listener.cursor().await.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_past_head_is_discarded() {
        let ledger = Arc::new(funded_ledger(1_000).await);
        let state = Arc::new(StateManager::in_memory().await.unwrap());
        state
            .save_checkpoint("ethereum", ledger.instance(), (50, 0))
            .await
            .unwrap();

        let listener = ChainListener::new(ledger.clone(), state, config())
            .await
            .unwrap();
        assert_eq!(listener.cursor().await, None);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_without_duplicates() {
        let ledger = Arc::new(funded_ledger(1_000).await);
        let state = Arc::new(StateManager::in_memory().await.unwrap());
        let (_, mut rx, shutdown_tx, task) = spawn_listener(&ledger, &state).await;

        assert_eq!(next(&mut rx).await.event.name(), "asset_support_changed");
        create(&ledger, "1").await;
        let first = next(&mut rx).await;

        ledger.disconnect_subscribers().await;
        // Committed while the listener is disconnected
        create(&ledger, "2").await;

        let second = next(&mut rx).await;
        assert_eq!(second.event.intent_id(), Some(&IntentId::from("2")));
        assert!(second.cursor() > first.cursor());

        create(&ledger, "3").await;
        let third = next(&mut rx).await;
        assert_eq!(third.event.intent_id(), Some(&IntentId::from("3")));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_checkpoint() {
        let ledger = Arc::new(funded_ledger(1_000).await);
        create(&ledger, "1").await;
        create(&ledger, "2").await;
        let log = ledger.events_since(None).await;

        let state = Arc::new(StateManager::in_memory().await.unwrap());
        state
            .save_checkpoint("ethereum", ledger.instance(), log[1].cursor())
            .await
            .unwrap();

        let (_, mut rx, shutdown_tx, task) = spawn_listener(&ledger, &state).await;

        let replayed = next(&mut rx).await;
        assert_eq!(replayed.event.intent_id(), Some(&IntentId::from("2")));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
