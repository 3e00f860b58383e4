//! Data models for the database abstraction layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::DriverKind;
pub use query::{DEFAULT_CHUNK_SIZE, ExecutedQuery, QueryParam, QueryRequest, Row, RowWindow};
pub use schema::{DataType, Table, TableColumn, TableIndex, TableKey};
