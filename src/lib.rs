//! Intent Bridge - cross-ledger intent relaying
//!
//! A source ledger holds the Lock Store and Intent Registry. The relayer
//! watches committed `Locked` events and executes them on the destination
//! with a validator-signed proof, and the orchestrator drives each transfer
//! request from registration to a terminal state.

pub mod api;
pub mod chain;
pub mod config;
pub mod destination;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod proof;
pub mod relayer;
pub mod state;
pub mod tx;
pub mod types;

pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use types::IntentId;
