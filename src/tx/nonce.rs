//! Access-key nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent relays never reuse a nonce
//! - Resync with the destination after a nonce conflict
//! - Gap detection

use crate::destination::DestinationLedger;
use crate::error::{BridgeError, BridgeResult};

use alloy_primitives::B256;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Nonce state for the signer's access key
struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Submitted but unconfirmed: nonce -> tx hash
    pending: BTreeMap<u64, B256>,
    /// Highest nonce known to be used on the destination
    confirmed: u64,
}

/// Hands out access-key nonces for one signer
pub struct NonceManager {
    signer: String,
    state: Mutex<Option<NonceState>>,
}

impl NonceManager {
    pub fn new(signer: impl Into<String>) -> Self {
        Self {
            signer: signer.into(),
            state: Mutex::new(None),
        }
    }

    pub fn signer(&self) -> &str {
        &self.signer
    }

    /// Load the on-chain nonce; the first nonce handed out is one above it
    pub async fn init(&self, destination: &dyn DestinationLedger) -> BridgeResult<()> {
        let on_chain = destination.access_key_nonce(&self.signer).await?;
        *self.state.lock().await = Some(NonceState {
            current: on_chain + 1,
            pending: BTreeMap::new(),
            confirmed: on_chain,
        });
        debug!("Initialized nonce for {}: {}", self.signer, on_chain + 1);
        Ok(())
    }

    pub async fn next(&self) -> BridgeResult<u64> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.uninitialized())?;
        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {} for {}", nonce, self.signer);
        Ok(nonce)
    }

    pub async fn mark_pending(&self, nonce: u64, tx_hash: B256) -> BridgeResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.uninitialized())?;
        state.pending.insert(nonce, tx_hash);
        Ok(())
    }

    /// The transaction using `nonce` was included
    pub async fn confirm(&self, nonce: u64) -> BridgeResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.uninitialized())?;
        state.pending.remove(&nonce);
        state.confirmed = state.confirmed.max(nonce);
        Ok(())
    }

    /// The transaction using `nonce` never reached the destination
    pub async fn release(&self, nonce: u64) -> BridgeResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.uninitialized())?;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed out again
        if nonce + 1 == state.current && nonce > state.confirmed {
            state.current = nonce;
        }
        Ok(())
    }

    /// Sync with the destination's view of the access key
    pub async fn sync(&self, destination: &dyn DestinationLedger) -> BridgeResult<()> {
        let on_chain = destination.access_key_nonce(&self.signer).await?;

        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.uninitialized())?;

        if on_chain > state.confirmed + 1 && state.pending.is_empty() {
            warn!(
                "Nonce gap detected for {}: expected {}, destination at {}",
                self.signer,
                state.confirmed + 1,
                on_chain
            );
        }

        state.pending.retain(|nonce, _| *nonce > on_chain);
        state.confirmed = on_chain;
        if state.current <= on_chain {
            state.current = on_chain + 1;
        }
        debug!("Synced nonce for {}: next {}", self.signer, state.current);
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    fn uninitialized(&self) -> BridgeError {
        BridgeError::Nonce {
            signer: self.signer.clone(),
            message: "nonce manager not initialized".to_string(),
        }
    }
}
