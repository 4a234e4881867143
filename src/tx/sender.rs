//! Transaction sender with bounded retry and nonce recovery

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::config::RelayerConfig;
use crate::destination::{DestinationLedger, ExecutionRequest, SignedTransaction, TxOutcome};
use crate::error::{BridgeError, BridgeResult};
use crate::types::backoff_delay;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Retry policy for destination submissions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub send_timeout: Duration,
}

impl From<&RelayerConfig> for RetryPolicy {
    fn from(config: &RelayerConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_delay(),
            max_delay: config.max_retry_delay(),
            send_timeout: config.submit_timeout(),
        }
    }
}

/// An accepted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub outcome: TxOutcome,
    pub attempts: u32,
}

/// Builds, signs and submits execution transactions to the destination
pub struct TransactionSender {
    destination: Arc<dyn DestinationLedger>,
    nonces: NonceManager,
    gas: GasEstimator,
    policy: RetryPolicy,
}

impl TransactionSender {
    /// Create a sender signing as `signer`; loads the signer's access-key nonce
    pub async fn new(
        destination: Arc<dyn DestinationLedger>,
        signer: impl Into<String>,
        policy: RetryPolicy,
    ) -> BridgeResult<Self> {
        let nonces = NonceManager::new(signer);
        nonces.init(destination.as_ref()).await?;

        info!(
            "Transaction sender initialized for {} on {}",
            nonces.signer(),
            destination.chain()
        );

        Ok(Self {
            destination,
            nonces,
            gas: GasEstimator::new(),
            policy,
        })
    }

    pub fn signer(&self) -> &str {
        self.nonces.signer()
    }

    /// Submit the execution of `request`, retrying transient failures
    ///
    /// Permanent rejections and exhausted retries both end in `RelayAborted`.
    pub async fn submit(&self, request: &ExecutionRequest) -> BridgeResult<Submission> {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.attempt(request).await {
                Ok(outcome) => {
                    info!(
                        "Intent {} submitted: {:?} (attempt {}/{})",
                        request.intent_id, outcome, attempt, max_attempts
                    );
                    return Ok(Submission {
                        outcome,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Intent {} submission failed (attempt {}/{}): {}",
                        request.intent_id, attempt, max_attempts, e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!("Intent {} rejected by destination: {}", request.intent_id, e);
                    return Err(BridgeError::RelayAborted {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }

            if attempt < max_attempts {
                let delay = backoff_delay(self.policy.base_delay, self.policy.max_delay, attempt);
                debug!("Retrying intent {} in {:?}", request.intent_id, delay);
                tokio::time::sleep(delay).await;
            }
        }

        Err(BridgeError::RelayAborted {
            attempts: max_attempts,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
    }

    async fn attempt(&self, request: &ExecutionRequest) -> BridgeResult<TxOutcome> {
        let actions = self.destination.execution_plan(request).await?;
        let actions = self.gas.prepare(actions)?;

        let nonce = self.nonces.next().await?;
        let tx = SignedTransaction::new(
            self.nonces.signer(),
            self.destination.executor_account(),
            nonce,
            actions,
        )?;
        self.nonces.mark_pending(nonce, tx.hash).await?;
        debug!(
            "Sending {} for intent {} with nonce {} ({} gas)",
            tx.hash,
            request.intent_id,
            nonce,
            tx.total_gas()
        );

        match timeout(self.policy.send_timeout, self.destination.send_transaction(&tx)).await {
            Ok(Ok(outcome)) => {
                self.nonces.confirm(nonce).await?;
                Ok(outcome)
            }
            Ok(Err(e @ BridgeError::ChainConnection { .. })) => {
                self.nonces.release(nonce).await?;
                Err(e)
            }
            Ok(Err(e)) => {
                // Nonce conflicts and rejected actions both leave the
                // destination's view authoritative.
                self.nonces.sync(self.destination.as_ref()).await?;
                Err(e)
            }
            Err(_) => {
                // The transaction may still land; a resubmission is idempotent.
                self.nonces.sync(self.destination.as_ref()).await?;
                Err(BridgeError::Timeout {
                    operation: format!("send transaction {}", tx.hash),
                })
            }
        }
    }
}
