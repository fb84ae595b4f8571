//! Concurrency control: fail-fast per-key locks and transactions

pub mod lock;
pub mod transaction;

pub use lock::{KeyLock, LockAttempt, LockTable};
pub use transaction::{QueryOp, Transaction};
