//! State storage for in-flight authorization transactions
//!
//! The bridge is stateless across requests except for two things: the
//! pending-authorization transaction (created when a user approves
//! consent, consumed exactly once by the upstream callback) and whatever
//! the downstream issuer needs to park between its own endpoints.
//!
//! `SessionStore` is the dyn-compatible seam: the in-memory backend here
//! is the default, and a shared backend (Redis-style) can slot in behind
//! the same trait for multi-instance deployments. `TransactionManager`
//! layers the single-use handle semantics on top.

pub mod error;
pub mod store;
pub mod transaction;

pub use error::{Error, Result};
pub use store::{MemoryStore, SessionStore};
pub use transaction::{AuthorizationRequest, OpenedTransaction, Transaction, TransactionManager};
