//! Keyed, first-write-wins rendezvous between a waiting pipeline and the
//! stream that eventually resolves it

use crate::error::{BridgeError, BridgeResult};
use crate::types::IntentId;

use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;

pub struct Correlator<T> {
    slots: DashMap<IntentId, watch::Sender<Option<T>>>,
}

/// Receiving half of an armed slot
pub struct Waiter<T> {
    intent_id: IntentId,
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Correlator<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Open a slot for `id`; must happen before whatever resolves it is triggered
    pub fn arm(&self, id: &IntentId) -> Waiter<T> {
        let (tx, rx) = watch::channel(None);
        self.slots.insert(id.clone(), tx);
        Waiter {
            intent_id: id.clone(),
            rx,
        }
    }

    /// Resolve the slot for `id`. Only the first value is kept; values for
    /// ids nobody armed are dropped.
    pub fn resolve(&self, id: &IntentId, value: T) -> bool {
        match self.slots.get(id) {
            Some(slot) => slot.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(value);
                true
            }),
            None => false,
        }
    }

    pub fn forget(&self, id: &IntentId) {
        self.slots.remove(id);
    }

    pub fn armed(&self) -> usize {
        self.slots.len()
    }
}

impl<T: Clone> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Waiter<T> {
    /// Wait for the resolution, bounded by `limit`
    pub async fn wait(mut self, limit: Duration, operation: &str) -> BridgeResult<T> {
        match tokio::time::timeout(limit, self.rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => (*value).clone().ok_or_else(|| {
                BridgeError::Internal(format!("empty resolution for {}", self.intent_id))
            }),
            Ok(Err(_)) => Err(BridgeError::Internal(format!(
                "wait for {} on {} was abandoned",
                operation, self.intent_id
            ))),
            Err(_) => Err(BridgeError::Timeout {
                operation: format!("{} of intent {}", operation, self.intent_id),
            }),
        }
    }
}
