//! Chain module - source event streaming
//!
//! This module provides:
//! - The `EventSource` seam over a ledger's event log and live stream
//! - A listener that replays from its last cursor and reconnects with backoff

pub mod listener;

pub use listener::{ChainListener, ListenerConfig};

use crate::error::BridgeResult;
use crate::events::{Cursor, EventEnvelope};
use crate::ledger::SourceLedger;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// A ledger whose committed events can be streamed and replayed
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> String;

    /// Identity of the event log; cursors from another log are meaningless here
    fn instance(&self) -> String;

    /// Live stream of events committed from now on
    async fn subscribe(&self) -> BridgeResult<broadcast::Receiver<EventEnvelope>>;

    /// Committed events strictly after `cursor`
    async fn events_since(&self, cursor: Option<Cursor>) -> BridgeResult<Vec<EventEnvelope>>;

    /// Current block height
    async fn health_check(&self) -> BridgeResult<u64>;
}

#[async_trait]
impl EventSource for SourceLedger {
    fn name(&self) -> String {
        self.chain().to_string()
    }

    fn instance(&self) -> String {
        SourceLedger::instance(self).to_string()
    }

    async fn subscribe(&self) -> BridgeResult<broadcast::Receiver<EventEnvelope>> {
        Ok(SourceLedger::subscribe(self).await)
    }

    async fn events_since(&self, cursor: Option<Cursor>) -> BridgeResult<Vec<EventEnvelope>> {
        Ok(SourceLedger::events_since(self, cursor).await)
    }

    async fn health_check(&self) -> BridgeResult<u64> {
        Ok(self.block_number().await)
    }
}
