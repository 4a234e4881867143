//! State management with SQLite persistence
//!
//! Handles:
//! - Transfer records with forward-only status transitions
//! - Relay outcomes for restart recovery
//! - Event stream checkpoints

mod manager;
pub mod records;

pub use manager::{Checkpoint, StateManager, TransferStats};
pub use records::{RelayRecord, RelayState, TransferRecord, TransferStatus};
