//! MySQL / MariaDB driver (sqlx).
//!
//! Statements failing with a deadlock (error 1213) outside an explicit
//! transaction are retried twice after a fixed backoff.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection as _, Executor};
use tracing::{info, warn};

use super::dump::{ToolCommand, dump_to_file, restore_from_file, tool_binary, wants_gzip};
use super::{
    Driver, PreparedSql, StatementCache, json_to_bool, json_to_string, query_failure,
};
use crate::config::{ATTR_DUMP_BIN, ATTR_RESTORE_BIN, ConnectionParameters};
use crate::db::params::bind_mysql_param;
use crate::db::types::RowToJson;
use crate::dialect::{Dialect, MySqlDialect};
use crate::error::{DbError, DbResult};
use crate::models::{DriverKind, QueryParam, Row, Table, TableColumn, TableIndex, TableKey};

/// Extra attempts after a deadlock.
pub const DEADLOCK_RETRIES: u32 = 2;

/// Fixed pause between deadlock retries.
pub const DEADLOCK_BACKOFF: Duration = Duration::from_millis(250);

/// Whether a failed statement should run again after `retries` retries.
///
/// A deadlock inside a transaction has already rolled it back, so only
/// autocommit statements are retried.
fn retry_after_deadlock(err: &DbError, retries: u32, in_transaction: bool) -> bool {
    err.is_retryable() && !in_transaction && retries < DEADLOCK_RETRIES
}

mod queries {
    pub const COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8mb4) AS column_name,
            CONVERT(COLUMN_TYPE USING utf8mb4) AS column_type,
            CONVERT(IS_NULLABLE USING utf8mb4) AS is_nullable
        FROM information_schema.COLUMNS
        WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
        ORDER BY ORDINAL_POSITION
        "#;

    pub const PRIMARY_KEY: &str = r#"
        SELECT CONVERT(COLUMN_NAME USING utf8mb4) AS column_name
        FROM information_schema.KEY_COLUMN_USAGE
        WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
        AND CONSTRAINT_NAME = 'PRIMARY'
        ORDER BY ORDINAL_POSITION
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            CONVERT(INDEX_NAME USING utf8mb4) AS index_name,
            CONVERT(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX SEPARATOR ',') USING utf8mb4) AS column_names,
            MIN(NON_UNIQUE) AS non_unique
        FROM information_schema.STATISTICS
        WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
        AND INDEX_NAME <> 'PRIMARY'
        GROUP BY INDEX_NAME
        ORDER BY INDEX_NAME
        "#;
}

#[derive(Debug)]
pub struct MySqlDriver {
    params: ConnectionParameters,
    dialect: MySqlDialect,
    conn: Option<MySqlConnection>,
    statements: StatementCache,
    version: Option<String>,
    in_transaction: bool,
}

impl MySqlDriver {
    pub fn new(params: ConnectionParameters) -> Self {
        Self {
            params,
            dialect: MySqlDialect,
            conn: None,
            statements: StatementCache::default(),
            version: None,
            in_transaction: false,
        }
    }

    fn connection(&mut self) -> DbResult<&mut MySqlConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::connection("MySQL connection is not open", "Connect first"))
    }

    async fn prepare(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<PreparedSql> {
        let prepared = self.statements.prepare(sql, &self.dialect);
        if self.statements.take_pending_flush() {
            if let Some(conn) = self.conn.as_mut() {
                conn.clear_cached_statements().await?;
            }
        }
        prepared
            .check_params(params)
            .map_err(|e| query_failure(e, sql, params, &self.dialect))?;
        Ok(prepared)
    }

    async fn execute_once(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let prepared = self.prepare(sql, params).await?;
        let conn = self.connection()?;
        let result = if params.is_empty() {
            conn.execute(prepared.sql.as_str()).await
        } else {
            let mut query = sqlx::query(&prepared.sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            query.execute(&mut *conn).await
        };
        result
            .map(|r| r.rows_affected())
            .map_err(|e| query_failure(e.into(), sql, params, &self.dialect))
    }

    fn client_tool(&self, attribute: &str, default: &str) -> ToolCommand {
        let mut tool = ToolCommand::new(tool_binary(&self.params, attribute, default))
            .arg(format!("--host={}", self.params.host()))
            .arg(format!("--user={}", self.params.username()))
            .env("MYSQL_PWD", self.params.password());
        if let Some(port) = self.params.effective_port() {
            tool = tool.arg(format!("--port={port}"));
        }
        tool
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::MySql
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn server_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    async fn connect(&mut self) -> DbResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        let mut options = MySqlConnectOptions::new()
            .host(self.params.host())
            .username(self.params.username())
            .password(self.params.password())
            .database(self.params.database())
            .charset("utf8mb4");
        if let Some(port) = self.params.effective_port() {
            options = options.port(port);
        }

        let conn = options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to connect to {}: {e}", self.params.masked_url()),
                "Check host, port, credentials and that the server is running",
            )
        })?;
        self.conn = Some(conn);
        self.in_transaction = false;

        let version_sql = self.dialect.version_sql();
        let rows = self.fetch(version_sql, &[]).await?;
        let version = rows
            .first()
            .and_then(|row| json_to_string(row.values().next()))
            .unwrap_or_default();
        self.dialect.set_server_version(&version);
        info!(url = %self.params.masked_url(), version = %version, "Connected to MySQL");
        self.version = Some(version);
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        self.statements.clear();
        self.in_transaction = false;
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
            info!(url = %self.params.masked_url(), "MySQL connection closed");
        }
        Ok(())
    }

    async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let prepared = self.prepare(sql, params).await?;
        let conn = self.connection()?;
        let result = if params.is_empty() {
            conn.fetch_all(prepared.sql.as_str()).await
        } else {
            let mut query = sqlx::query(&prepared.sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            query.fetch_all(&mut *conn).await
        };
        result
            .map(|rows| rows.iter().map(RowToJson::to_row).collect())
            .map_err(|e| query_failure(e.into(), sql, params, &self.dialect))
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let mut retries = 0;
        loop {
            match self.execute_once(sql, params).await {
                Err(err) if retry_after_deadlock(&err, retries, self.in_transaction) => {
                    retries += 1;
                    warn!(
                        attempt = retries,
                        backoff_ms = DEADLOCK_BACKOFF.as_millis() as u64,
                        "Deadlock detected, retrying statement"
                    );
                    tokio::time::sleep(DEADLOCK_BACKOFF).await;
                }
                result => return result,
            }
        }
    }

    async fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        let conn = self.connection()?;
        let result = conn.execute(sql).await;
        result
            .map(|_| ())
            .map_err(|e| query_failure(e.into(), sql, &[], &self.dialect))
    }

    async fn flush_prepared_statements(&mut self) -> DbResult<()> {
        self.statements.clear();
        if let Some(conn) = self.conn.as_mut() {
            conn.clear_cached_statements().await?;
        }
        Ok(())
    }

    async fn begin(&mut self) -> DbResult<()> {
        let sql = self.dialect.begin_sql();
        self.execute_raw(sql).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let sql = self.dialect.commit_sql();
        self.in_transaction = false;
        self.execute_raw(sql).await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let sql = self.dialect.rollback_sql();
        self.in_transaction = false;
        self.execute_raw(sql).await
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn table_information(&mut self, table: &str) -> DbResult<Option<Table>> {
        let name = [QueryParam::from(table)];
        let columns = self.fetch(queries::COLUMNS, &name).await?;
        if columns.is_empty() {
            return Ok(None);
        }

        let mut info = Table::new(table);
        for row in &columns {
            info.columns.push(TableColumn::introspected(
                json_to_string(row.get("column_name")).unwrap_or_default(),
                json_to_string(row.get("column_type")).unwrap_or_default(),
                json_to_bool(row.get("is_nullable")),
            ));
        }

        info.keys = self
            .fetch(queries::PRIMARY_KEY, &name)
            .await?
            .iter()
            .filter_map(|row| json_to_string(row.get("column_name")))
            .map(TableKey::new)
            .collect();

        info.indexes = self
            .fetch(queries::INDEXES, &name)
            .await?
            .iter()
            .filter_map(|row| {
                let index_name = json_to_string(row.get("index_name"))?;
                let columns = json_to_string(row.get("column_names")).unwrap_or_default();
                Some(
                    TableIndex::new(index_name, columns)
                        .unique(!json_to_bool(row.get("non_unique"))),
                )
            })
            .collect();

        Ok(Some(info))
    }

    async fn dump(&mut self, path: &Path, tables: &[String]) -> DbResult<()> {
        let tool = self
            .client_tool(ATTR_DUMP_BIN, "mysqldump")
            .args(["--single-transaction", "--skip-lock-tables"])
            .arg(self.params.database())
            .args(tables.iter().cloned());
        dump_to_file(&tool, path, wants_gzip(&self.params, path)).await?;
        info!(path = %path.display(), tables = tables.len(), "MySQL dump complete");
        Ok(())
    }

    async fn restore(&mut self, path: &Path) -> DbResult<()> {
        let tool = self
            .client_tool(ATTR_RESTORE_BIN, "mysql")
            .arg(self.params.database());
        restore_from_file(&tool, path, wants_gzip(&self.params, path)).await?;
        info!(path = %path.display(), "MySQL restore complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_tool_arguments() {
        let params = ConnectionParameters::new("mysql", "db.local", "agp", "secret", "agp")
            .with_port(3307);
        let driver = MySqlDriver::new(params);
        let tool = driver.client_tool(ATTR_DUMP_BIN, "mysqldump");
        assert_eq!(tool.program, "mysqldump");
        assert!(tool.args.contains(&"--host=db.local".to_string()));
        assert!(tool.args.contains(&"--port=3307".to_string()));
        assert!(!tool.args.iter().any(|a| a.contains("secret")));
        assert_eq!(
            tool.envs,
            vec![("MYSQL_PWD".to_string(), "secret".to_string())]
        );
    }

    #[test]
    fn test_deadlock_retried_twice_then_surfaces() {
        let deadlock = DbError::query("Deadlock found", Some("1213".to_string()));
        assert!(retry_after_deadlock(&deadlock, 0, false));
        assert!(retry_after_deadlock(&deadlock, 1, false));
        assert!(!retry_after_deadlock(&deadlock, 2, false));

        // Same decision loop as `execute` against a statement that always deadlocks
        let mut attempts = 0;
        let mut retries = 0;
        loop {
            attempts += 1;
            if !retry_after_deadlock(&deadlock, retries, false) {
                break;
            }
            retries += 1;
        }
        assert_eq!(attempts, 1 + DEADLOCK_RETRIES);
    }

    #[test]
    fn test_deadlock_not_retried_inside_transaction() {
        let deadlock = DbError::query("Deadlock found", Some("1213".to_string()));
        assert!(!retry_after_deadlock(&deadlock, 0, true));

        let syntax = DbError::query("syntax error", Some("1064".to_string()));
        assert!(!retry_after_deadlock(&syntax, 0, false));
    }

    #[test]
    fn test_not_connected_until_connect() {
        let driver = MySqlDriver::new(ConnectionParameters::new(
            "mysql", "localhost", "u", "p", "db",
        ));
        assert!(!driver.is_connected());
        assert!(driver.server_version().is_none());
    }
}
