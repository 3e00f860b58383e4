//! Connection-related data models.
//!
//! This module defines the supported database engines and the identifiers
//! used to select them.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Includes MariaDB
    MySql,
    Postgres,
    Oracle,
    SqlServer,
    Sqlite,
}

impl DriverKind {
    /// All engines, in the order they are documented.
    pub const ALL: [DriverKind; 5] = [
        Self::MySql,
        Self::Postgres,
        Self::Oracle,
        Self::SqlServer,
        Self::Sqlite,
    ];

    /// Resolve a driver identifier (case-insensitive).
    ///
    /// Legacy identifiers such as `mysqli`, `oci8` and `sqlsrv` are accepted
    /// alongside the canonical names.
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier.trim().to_lowercase().as_str() {
            "mysql" | "mysqli" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" | "pgsql" => Some(Self::Postgres),
            "oracle" | "oci8" => Some(Self::Oracle),
            "sqlserver" | "sqlsrv" | "mssql" => Some(Self::SqlServer),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Canonical identifier for this engine.
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::Oracle => "oracle",
            Self::SqlServer => "sqlserver",
            Self::Sqlite => "sqlite",
        }
    }

    /// Get the display name for this engine.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
            Self::Oracle => "Oracle",
            Self::SqlServer => "SQL Server",
            Self::Sqlite => "SQLite",
        }
    }

    /// Get the default port for this engine.
    ///
    /// SQLite is file-backed and has no port.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::MySql => Some(3306),
            Self::Postgres => Some(5432),
            Self::Oracle => Some(1521),
            Self::SqlServer => Some(1433),
            Self::Sqlite => None,
        }
    }

    /// True for engines that live in a local file rather than behind a server.
    pub fn is_file_based(&self) -> bool {
        matches!(self, Self::Sqlite)
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_identifier(s).ok_or_else(|| format!("unknown driver identifier: {s}"))
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
