//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Source event stream health
//! - Intent and lock activity
//! - Relay submissions and dead letters
//! - Transfer outcomes

use crate::error::{BridgeError, BridgeResult};
use crate::events::LedgerEvent;

use alloy_primitives::Address;
use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "intent_bridge_chain_connected",
        "Event stream status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "intent_bridge_chain_block_height",
        "Last block observed per chain",
        &["chain"]
    ).unwrap();

    pub static ref LISTENER_RECONNECTS: CounterVec = register_counter_vec!(
        "intent_bridge_listener_reconnects_total",
        "Event stream resubscriptions",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "intent_bridge_events_received_total",
        "Total source events received by type",
        &["chain", "event_type"]
    ).unwrap();

    // Custody
    pub static ref LOCKED_AMOUNT: GaugeVec = register_gauge_vec!(
        "intent_bridge_locked_amount",
        "Amount held in Lock Store custody per asset",
        &["asset"]
    ).unwrap();

    // Relay metrics
    pub static ref RELAY_SUBMISSIONS: CounterVec = register_counter_vec!(
        "intent_bridge_relay_submissions_total",
        "Destination submissions by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref RELAY_DUPLICATES_SUPPRESSED: CounterVec = register_counter_vec!(
        "intent_bridge_relay_duplicates_suppressed_total",
        "Lock observations suppressed because the intent was already relayed",
        &[]
    ).unwrap();

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "intent_bridge_relay_latency_seconds",
        "Time from lock observation to relay outcome",
        &["chain"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Transfer metrics
    pub static ref INTENTS_CREATED: CounterVec = register_counter_vec!(
        "intent_bridge_intents_created_total",
        "Intents registered on the source ledger",
        &[]
    ).unwrap();

    pub static ref TRANSFERS_COMPLETED: CounterVec = register_counter_vec!(
        "intent_bridge_transfers_completed_total",
        "Transfers that reached Completed",
        &[]
    ).unwrap();

    pub static ref TRANSFERS_FAILED: CounterVec = register_counter_vec!(
        "intent_bridge_transfers_failed_total",
        "Transfers that reached Failed, by error kind",
        &["reason"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "intent_bridge_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "intent_bridge_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Config(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Encode every registered metric in the text exposition format
pub fn render() -> BridgeResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| BridgeError::Internal(format!("metrics encoding: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| BridgeError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_observed(chain: &str, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain])
        .set(block_number as f64);
}

pub fn record_listener_reconnect(chain: &str) {
    LISTENER_RECONNECTS.with_label_values(&[chain]).inc();
}

pub fn record_event(chain: &str, event: &LedgerEvent) {
    EVENTS_RECEIVED
        .with_label_values(&[chain, event.name()])
        .inc();
}

pub fn record_locked_amount(asset: Address, amount: u128) {
    LOCKED_AMOUNT
        .with_label_values(&[&asset.to_string()])
        .set(amount as f64);
}

pub fn record_relay_submission(chain: &str, outcome: &str) {
    RELAY_SUBMISSIONS
        .with_label_values(&[chain, outcome])
        .inc();
}

pub fn record_duplicate_suppressed() {
    RELAY_DUPLICATES_SUPPRESSED.with_label_values(&[]).inc();
}

pub fn record_relay_latency(chain: &str, latency_secs: f64) {
    RELAY_LATENCY
        .with_label_values(&[chain])
        .observe(latency_secs);
}

pub fn record_intent_created() {
    INTENTS_CREATED.with_label_values(&[]).inc();
}

pub fn record_transfer_completed() {
    TRANSFERS_COMPLETED.with_label_values(&[]).inc();
}

pub fn record_transfer_failed(reason: &str) {
    TRANSFERS_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
