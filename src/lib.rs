//! agp-dal
//!
//! A vendor-neutral SQL database abstraction layer for MySQL, PostgreSQL,
//! Oracle, SQL Server and SQLite. Callers write `?` placeholders and
//! neutral schema descriptions; a [`Connection`] and its engine
//! [`Driver`](driver::Driver) handle dialect translation, caching,
//! nested transactions and dump/restore.

pub mod config;
pub mod db;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod format;
pub mod models;

pub use config::ConnectionParameters;
pub use db::Connection;
pub use driver::DriverFactory;
pub use error::{DbError, DbResult};
