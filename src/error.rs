//! Error types for the intent bridge

use crate::types::IntentId;

use alloy_primitives::Address;
use thiserror::Error;

/// Coarse error taxonomy surfaced to callers and the HTTP layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Unauthorized,
    NotFound,
    Conflict,
    Expired,
    InsufficientFunds,
    Timeout,
    ExternalFailure,
    Internal,
}

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{caller} is not authorized to {action}")]
    Unauthorized { caller: Address, action: &'static str },

    #[error("Account {account} is not authorized to {action}")]
    AccountUnauthorized { account: String, action: &'static str },

    #[error("Intent {0} not found")]
    IntentNotFound(IntentId),

    #[error("Intent {0} already exists")]
    AlreadyExists(IntentId),

    #[error("Intent {0} already executed")]
    AlreadyExecuted(IntentId),

    #[error("Intent {id} is {status}, expected Pending")]
    NotPending { id: IntentId, status: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Intent {id} expired at {expiration} (now {now})")]
    Expired { id: IntentId, expiration: u64, now: u64 },

    #[error("Asset {0} is not supported")]
    UnsupportedAsset(Address),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Receiver must not be empty")]
    InvalidReceiver,

    #[error("Insufficient locked balance of {asset}: locked {locked}, requested {requested}")]
    InsufficientLocked {
        asset: Address,
        locked: u128,
        requested: u128,
    },

    #[error("Insufficient balance of {asset} for {account}: have {have}, need {need}")]
    InsufficientFunds {
        asset: Address,
        account: String,
        have: u128,
        need: u128,
    },

    #[error(
        "{account} has not authorized {need} of {asset}: allowance {allowance}, balance {balance}"
    )]
    InsufficientAuthorization {
        account: Address,
        asset: Address,
        allowance: u128,
        balance: u128,
        need: u128,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Transaction rejected: {0}")]
    Transaction(String),

    #[error("Nonce error for {signer}: {message}")]
    Nonce { signer: String, message: String },

    #[error("Event stream error: {0}")]
    EventStream(String),

    #[error("Relay gave up after {attempts} attempt(s): {message}")]
    RelayAborted { attempts: u32, message: String },

    #[error("Destination execution for intent {intent_id} dead-lettered: {message}")]
    DeadLetter { intent_id: IntentId, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Map the error onto the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidRequest(_)
            | BridgeError::InvalidAmount
            | BridgeError::InvalidReceiver
            | BridgeError::UnsupportedAsset(_) => ErrorKind::InvalidRequest,
            BridgeError::Unauthorized { .. } | BridgeError::AccountUnauthorized { .. } => {
                ErrorKind::Unauthorized
            }
            BridgeError::IntentNotFound(_) => ErrorKind::NotFound,
            BridgeError::AlreadyExists(_)
            | BridgeError::AlreadyExecuted(_)
            | BridgeError::NotPending { .. }
            | BridgeError::InvalidStateTransition { .. } => ErrorKind::Conflict,
            BridgeError::Expired { .. } => ErrorKind::Expired,
            BridgeError::InsufficientLocked { .. }
            | BridgeError::InsufficientFunds { .. }
            | BridgeError::InsufficientAuthorization { .. } => ErrorKind::InsufficientFunds,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::ChainConnection { .. }
            | BridgeError::Transaction(_)
            | BridgeError::Nonce { .. }
            | BridgeError::EventStream(_)
            | BridgeError::RelayAborted { .. }
            | BridgeError::DeadLetter { .. } => ErrorKind::ExternalFailure,
            BridgeError::Config(_) | BridgeError::Database(_) | BridgeError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::ChainConnection { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::Nonce { .. }
                | BridgeError::EventStream(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            BridgeError::DeadLetter { .. }
                | BridgeError::RelayAborted { .. }
                | BridgeError::InsufficientLocked { .. }
        )
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
