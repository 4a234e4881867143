//! Transaction management: nonces, gas budgeting and submission

pub mod gas;
pub mod nonce;
pub mod sender;

pub use gas::GasEstimator;
pub use nonce::NonceManager;
pub use sender::{RetryPolicy, Submission, TransactionSender};
