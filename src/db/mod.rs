//! Connection facade and its supporting pieces.
//!
//! - `connection`: the [`Connection`] callers use
//! - `cache`: query-result and table-list caches
//! - `transaction`: nested transaction state machine
//! - `escape`: parameter sanitization
//! - `types`, `params`: row decoding and parameter binding for the sqlx engines

pub mod cache;
pub mod connection;
pub mod escape;
pub(crate) mod params;
pub mod transaction;
pub mod types;

pub use cache::{QueryCache, TableCache};
pub use connection::Connection;
pub use transaction::{TransactionAction, TransactionState};
