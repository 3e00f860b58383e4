//! Driver resolution.

use crate::config::ConnectionParameters;
use crate::error::{DbError, DbResult};
use crate::models::DriverKind;

use super::Driver;
use super::mysql::MySqlDriver;
use super::postgres::PostgresDriver;
use super::sqlite::SqliteDriver;

/// Builds a fresh, unconnected driver for a set of connection parameters.
///
/// Every call returns a new instance; drivers are never shared between
/// connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverFactory;

impl DriverFactory {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the configured driver identifier.
    ///
    /// Unknown identifiers, and engines whose cargo feature is disabled,
    /// fail with [`DbError::DriverNotFound`].
    pub fn create(&self, params: &ConnectionParameters) -> DbResult<Box<dyn Driver>> {
        let kind = params
            .driver_kind()
            .ok_or_else(|| DbError::driver_not_found(params.driver()))?;

        match kind {
            DriverKind::MySql => Ok(Box::new(MySqlDriver::new(params.clone()))),
            DriverKind::Postgres => Ok(Box::new(PostgresDriver::new(params.clone()))),
            DriverKind::Sqlite => Ok(Box::new(SqliteDriver::new(params.clone()))),
            #[cfg(feature = "oracle")]
            DriverKind::Oracle => Ok(Box::new(super::oracle::OracleDriver::new(params.clone()))),
            #[cfg(feature = "mssql")]
            DriverKind::SqlServer => Ok(Box::new(super::sqlserver::SqlServerDriver::new(
                params.clone(),
            ))),
            #[allow(unreachable_patterns)]
            other => Err(DbError::driver_not_found(format!(
                "{} (built without the {} feature)",
                params.driver(),
                feature_for(other)
            ))),
        }
    }

    /// Whether this build can create a driver for `kind`.
    pub fn is_available(kind: DriverKind) -> bool {
        match kind {
            DriverKind::MySql | DriverKind::Postgres | DriverKind::Sqlite => true,
            DriverKind::Oracle => cfg!(feature = "oracle"),
            DriverKind::SqlServer => cfg!(feature = "mssql"),
        }
    }
}

fn feature_for(kind: DriverKind) -> &'static str {
    match kind {
        DriverKind::Oracle => "oracle",
        DriverKind::SqlServer => "mssql",
        _ => "default",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_driver() {
        let params = ConnectionParameters::new("db2", "localhost", "u", "p", "db");
        let err = DriverFactory::new().create(&params).unwrap_err();
        assert!(matches!(err, DbError::DriverNotFound { .. }));
    }

    #[test]
    fn test_resolves_aliases() {
        let factory = DriverFactory::new();
        for (identifier, kind) in [
            ("mysqli", DriverKind::MySql),
            ("pgsql", DriverKind::Postgres),
            ("sqlite3", DriverKind::Sqlite),
        ] {
            let params = ConnectionParameters::new(identifier, "localhost", "u", "p", "db");
            let driver = factory.create(&params).unwrap();
            assert_eq!(driver.kind(), kind);
            assert!(!driver.is_connected());
        }
    }

    #[test]
    fn test_feature_gated_drivers() {
        let params = ConnectionParameters::new("oracle", "localhost", "u", "p", "db");
        let result = DriverFactory::new().create(&params);
        assert_eq!(
            result.is_ok(),
            DriverFactory::is_available(DriverKind::Oracle)
        );
    }
}
