//! Shared wiring for the integration tests: every component of the bridge in
//! one process, backed by an in-memory database that can outlive a bridge.

#![allow(dead_code)]

use alloy_primitives::Address;
use intent_bridge::chain::{ChainListener, ListenerConfig};
use intent_bridge::config::Settings;
use intent_bridge::destination::{DestinationExecutor, DestinationLedger};
use intent_bridge::ledger::SourceLedger;
use intent_bridge::orchestrator::Orchestrator;
use intent_bridge::proof::ProofSigner;
use intent_bridge::relayer::Relayer;
use intent_bridge::state::{StateManager, TransferRecord, TransferStatus};
use intent_bridge::tx::{RetryPolicy, TransactionSender};
use intent_bridge::IntentId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const ASSET: Address = Address::repeat_byte(0xaa);
pub const SENDER: Address = Address::repeat_byte(0x33);
pub const OPERATOR: Address = Address::repeat_byte(0x22);

pub fn config(lock_timeout_secs: u64) -> String {
    format!(
        r#"
[relayer]
instance_id = "integration"
max_concurrent_relays = 4
max_retries = 5
retry_delay_ms = 5
max_retry_delay_ms = 20
submit_timeout_secs = 5
reconnect_delay_ms = 5
max_reconnect_delay_ms = 20
checkpoint_interval_ms = 20
health_check_interval_secs = 30
signer_account = "bridge-agent.testnet"
attester_keys = ["0101010101010101010101010101010101010101010101010101010101010101"]

[source]
chain = "ethereum"
owner = "0x1111111111111111111111111111111111111111"
operator = "0x2222222222222222222222222222222222222222"
default_sender = "0x3333333333333333333333333333333333333333"
lock_store_address = "0x4444444444444444444444444444444444444444"
registry_address = "0x5555555555555555555555555555555555555555"
supported_assets = ["0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]

[[source.genesis]]
asset = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
account = "0x3333333333333333333333333333333333333333"
balance = "1000000"
registry_allowance = "1000000"

[destination]
chain = "near"
executor_account = "bridge.testnet"
owner_account = "owner.testnet"
required_signatures = 1
validators = ["8a88e3dd7409f195fd52db2d3cba5d72ca6709bf1d94121bf3748801b40f6f5c"]

[[destination.token_mappings]]
asset = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
token = "usdc.testnet"

[orchestrator]
lock_timeout_secs = {lock_timeout_secs}
relay_timeout_secs = 30
routes = [{{ source = "ethereum", target = "near" }}]

[database]
url = "sqlite::memory:"
max_connections = 1
min_connections = 1

[api]
host = "127.0.0.1"
port = 0

[metrics]
enabled = false
port = 0
"#
    )
}

pub struct Bridge {
    pub settings: Settings,
    pub ledger: Arc<SourceLedger>,
    pub destination: Arc<DestinationExecutor>,
    pub state: Arc<StateManager>,
    pub listener: Arc<ChainListener>,
    pub relayer: Arc<Relayer>,
    pub orchestrator: Arc<Orchestrator>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Build every component without starting any background task
pub async fn build(lock_timeout_secs: u64) -> Bridge {
    let state = Arc::new(StateManager::in_memory().await.unwrap());
    build_on(lock_timeout_secs, state).await
}

/// Build on an existing store, as a restarted process would; the ledgers are fresh
pub async fn build_on(lock_timeout_secs: u64, state: Arc<StateManager>) -> Bridge {
    let settings = Settings::from_toml_str(&config(lock_timeout_secs)).unwrap();
    let ledger = Arc::new(SourceLedger::from_config(&settings.source).await.unwrap());
    let destination = Arc::new(
        DestinationExecutor::from_config(&settings.destination, &settings.relayer.signer_account)
            .unwrap(),
    );
    let destination_ledger: Arc<dyn DestinationLedger> = destination.clone();

    let sender = TransactionSender::new(
        destination_ledger.clone(),
        settings.relayer.signer_account.clone(),
        RetryPolicy::from(&settings.relayer),
    )
    .await
    .unwrap();
    let signer = ProofSigner::from_hex(&settings.relayer.attester_keys).unwrap();
    let relayer = Arc::new(Relayer::new(
        destination_ledger,
        sender,
        signer,
        state.clone(),
        settings.relayer.max_concurrent_relays,
    ));
    relayer.restore().await.unwrap();

    let listener = Arc::new(
        ChainListener::new(
            ledger.clone(),
            state.clone(),
            ListenerConfig::from(&settings.relayer),
        )
        .await
        .unwrap(),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        ledger.clone(),
        state.clone(),
        settings.orchestrator.clone(),
        &settings.source,
        settings.destination.chain.clone(),
    ));
    orchestrator.recover_interrupted().await.unwrap();

    let (shutdown, _) = watch::channel(false);
    Bridge {
        settings,
        ledger,
        destination,
        state,
        listener,
        relayer,
        orchestrator,
        shutdown,
        handles: Vec::new(),
    }
}

/// Build and run the listener, relayer and orchestrator loops
pub async fn start(lock_timeout_secs: u64) -> Bridge {
    let state = Arc::new(StateManager::in_memory().await.unwrap());
    start_on(lock_timeout_secs, state).await
}

pub async fn start_on(lock_timeout_secs: u64, state: Arc<StateManager>) -> Bridge {
    let mut bridge = build_on(lock_timeout_secs, state).await;

    let relayer_events = bridge.listener.subscribe_events();
    let orchestrator_events = bridge.listener.subscribe_events();
    let outcomes = bridge.relayer.subscribe_outcomes();

    let relayer = bridge.relayer.clone();
    let shutdown = bridge.shutdown.subscribe();
    bridge.handles.push(tokio::spawn(async move {
        relayer.run(relayer_events, shutdown).await.unwrap();
    }));

    let orchestrator = bridge.orchestrator.clone();
    let shutdown = bridge.shutdown.subscribe();
    bridge.handles.push(tokio::spawn(async move {
        orchestrator
            .run(orchestrator_events, outcomes, shutdown)
            .await
            .unwrap();
    }));

    let listener = bridge.listener.clone();
    let shutdown = bridge.shutdown.subscribe();
    bridge.handles.push(tokio::spawn(async move {
        listener.listen(shutdown).await.unwrap();
    }));

    bridge
}

impl Bridge {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            handle.await.unwrap();
        }
    }

    /// Poll until the transfer reaches a terminal status
    pub async fn settled(&self, id: &IntentId) -> TransferRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(record) = self.orchestrator.get_transfer(id).await.unwrap() {
                    if matches!(record.status, TransferStatus::Completed | TransferStatus::Failed) {
                        return record;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transfer never settled")
    }
}
