//! Intent Bridge - cross-ledger intent relayer
//!
//! Runs the source ledger, the chain listener, the relayer and the
//! orchestrator in one process, with an HTTP API for transfer requests.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use intent_bridge::api::{self, AppState};
use intent_bridge::chain::{ChainListener, EventSource, ListenerConfig};
use intent_bridge::config::Settings;
use intent_bridge::destination::{DestinationExecutor, DestinationLedger};
use intent_bridge::ledger::SourceLedger;
use intent_bridge::metrics::{self, MetricsServer};
use intent_bridge::orchestrator::Orchestrator;
use intent_bridge::proof::ProofSigner;
use intent_bridge::relayer::Relayer;
use intent_bridge::state::StateManager;
use intent_bridge::tx::{RetryPolicy, TransactionSender};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Intent Bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} -> {} as {}",
        settings.source.chain, settings.destination.chain, settings.relayer.instance_id
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;
    info!("Database migrations complete");

    // Source and destination ledgers
    let ledger = Arc::new(SourceLedger::from_config(&settings.source).await?);
    let destination = Arc::new(
        DestinationExecutor::from_config(&settings.destination, &settings.relayer.signer_account)
            .context("invalid destination configuration")?,
    );
    let destination_ledger: Arc<dyn DestinationLedger> = destination.clone();
    info!("Ledgers initialized");

    // Relayer
    let sender = TransactionSender::new(
        destination_ledger.clone(),
        settings.relayer.signer_account.clone(),
        RetryPolicy::from(&settings.relayer),
    )
    .await?;
    let signer = ProofSigner::from_hex(&settings.relayer.attester_keys)
        .context("invalid attester keys")?;
    let relayer = Arc::new(Relayer::new(
        destination_ledger,
        sender,
        signer,
        state_manager.clone(),
        settings.relayer.max_concurrent_relays,
    ));
    relayer.restore().await?;

    // Listener
    let listener = Arc::new(
        ChainListener::new(
            ledger.clone(),
            state_manager.clone(),
            ListenerConfig::from(&settings.relayer),
        )
        .await?,
    );

    // Orchestrator
    let orchestrator = Arc::new(Orchestrator::new(
        ledger.clone(),
        state_manager.clone(),
        settings.orchestrator.clone(),
        &settings.source,
        settings.destination.chain.clone(),
    ));
    orchestrator.recover_interrupted().await?;
    info!("Relayer and orchestrator initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Subscribe before the listener starts so no event is missed
    let relayer_events = listener.subscribe_events();
    let orchestrator_events = listener.subscribe_events();
    let relay_outcomes = relayer.subscribe_outcomes();

    let relayer_handle = tokio::spawn({
        let relayer = relayer.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = relayer.run(relayer_events, shutdown).await {
                error!("Relayer error: {}", e);
            }
        }
    });

    let orchestrator_handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = orchestrator
                .run(orchestrator_events, relay_outcomes, shutdown)
                .await
            {
                error!("Orchestrator error: {}", e);
            }
        }
    });

    let listener_handle = tokio::spawn({
        let listener = listener.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = listener.listen(shutdown).await {
                error!("Chain listener error: {}", e);
            }
        }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            orchestrator: orchestrator.clone(),
            state_manager: state_manager.clone(),
            ledger: ledger.clone(),
            started_at: Instant::now(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let ledger = ledger.clone();
        let state_manager = state_manager.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;
                match ledger.health_check().await {
                    Ok(block) => metrics::record_block_observed(ledger.chain(), block),
                    Err(e) => {
                        healthy = false;
                        warn!("Source ledger health check failed: {}", e);
                    }
                }
                if let Err(e) = state_manager.health_check().await {
                    healthy = false;
                    warn!("Database health check failed: {}", e);
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Intent Bridge is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown of the pipelines, then abort the servers
    if shutdown_tx.send(true).is_err() {
        warn!("All workers already stopped");
    }
    for result in join_all([listener_handle, relayer_handle, orchestrator_handle]).await {
        if let Err(e) = result {
            error!("Worker task failed: {}", e);
        }
    }

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Intent Bridge stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,intent_bridge=debug,sqlx=warn,hyper=warn")
    });

    // INTENT_BRIDGE_LOG_FORMAT=json switches to structured output
    let json = std::env::var("INTENT_BRIDGE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
