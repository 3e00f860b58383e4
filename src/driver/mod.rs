//! Engine drivers.
//!
//! A [`Driver`] owns one vendor connection and the dialect for its engine.
//! Operations that can be expressed with the dialect alone (upsert fallback,
//! chunked multi-insert, column DDL) have default implementations; engines
//! override them only where their behaviour diverges.
//!
//! # Architecture
//!
//! - `mysql`, `postgres`, `sqlite`: sqlx-backed drivers
//! - `oracle`: `oracle` crate, behind the `oracle` feature
//! - `sqlserver`: `tiberius`, behind the `mssql` feature
//! - `dump`: vendor dump/restore tooling shared by all drivers

pub mod dump;
pub mod factory;
pub mod mysql;
#[cfg(feature = "oracle")]
pub mod oracle;
pub mod postgres;
pub mod sqlite;
#[cfg(feature = "mssql")]
pub mod sqlserver;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::config::ConnectionParameters;
use crate::dialect::{Dialect, is_key, render_query, rewrite_placeholders};
use crate::error::{DbError, DbResult};
use crate::models::{DriverKind, QueryParam, Row, Table, TableColumn};

pub use crate::dialect::MAX_PARAMS_PER_STATEMENT;
pub use factory::DriverFactory;

/// Statement cache size that triggers a flush.
pub const STATEMENT_CACHE_LIMIT: usize = 500;

/// Savepoint guarding multi-statement DDL inside an open transaction.
pub const DDL_SAVEPOINT: &str = "agp_ddl";

/// Server and session facts reported by [`Driver::db_info`].
#[derive(Debug, Clone, Serialize)]
pub struct DbInfo {
    pub driver: DriverKind,
    pub version: Option<String>,
    pub database: String,
    pub host: String,
    /// Engine-specific details, e.g. the SQLite file path
    pub extras: BTreeMap<String, String>,
}

/// A caller statement translated to the engine's placeholder syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSql {
    pub sql: String,
    pub placeholders: usize,
}

impl PreparedSql {
    /// Fail before touching the engine when the parameter count is wrong.
    pub fn check_params(&self, params: &[QueryParam]) -> DbResult<()> {
        if params.len() == self.placeholders {
            return Ok(());
        }
        Err(DbError::query(
            format!(
                "statement has {} placeholders but {} parameters were supplied",
                self.placeholders,
                params.len()
            ),
            None,
        ))
    }
}

/// Rewritten statements keyed by the SHA-256 of the caller SQL.
///
/// When more than [`STATEMENT_CACHE_LIMIT`] statements accumulate the cache
/// is cleared and a flush is flagged so the driver can close the engine's
/// prepared statements too.
#[derive(Debug)]
pub struct StatementCache {
    entries: HashMap<String, PreparedSql>,
    limit: usize,
    pending_flush: bool,
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::with_limit(STATEMENT_CACHE_LIMIT)
    }
}

impl StatementCache {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
            pending_flush: false,
        }
    }

    pub fn prepare(&mut self, sql: &str, dialect: &dyn Dialect) -> PreparedSql {
        let key = hex::encode(Sha256::digest(sql.as_bytes()));
        if let Some(prepared) = self.entries.get(&key) {
            return prepared.clone();
        }

        if self.entries.len() >= self.limit {
            tracing::warn!(
                entries = self.entries.len(),
                "Statement cache full, closing prepared statements"
            );
            self.entries.clear();
            self.pending_flush = true;
        }

        let rewritten =
            rewrite_placeholders(sql, dialect.placeholder_style(), dialect.backslash_escapes());
        let prepared = PreparedSql {
            sql: rewritten.sql,
            placeholders: rewritten.placeholders,
        };
        self.entries.insert(key, prepared.clone());
        prepared
    }

    /// Whether the engine's prepared statements should be closed now.
    pub fn take_pending_flush(&mut self) -> bool {
        std::mem::take(&mut self.pending_flush)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending_flush = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Attach the rendered query to a failure and log it.
pub(crate) fn query_failure(
    err: DbError,
    sql: &str,
    params: &[QueryParam],
    dialect: &dyn Dialect,
) -> DbError {
    let err = match err {
        DbError::Query { .. } => err.with_query(render_query(sql, params, dialect), params),
        other => other,
    };
    tracing::error!(error = %err, driver = %dialect.kind(), "Query failed");
    err
}

/// Read an integer out of a row value that may arrive as a number or as text.
pub(crate) fn json_to_u64(value: Option<&JsonValue>) -> u64 {
    match value {
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().map(|f| f.max(0.0) as u64).unwrap_or(0),
        Some(JsonValue::Bool(b)) => u64::from(*b),
        _ => 0,
    }
}

/// Read a string column, accepting any scalar.
pub(crate) fn json_to_string(value: Option<&JsonValue>) -> Option<String> {
    match value {
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

/// Whether a nullable flag column (`YES`/`NO`, `1`/`0`, bool) reads as true.
pub(crate) fn json_to_bool(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(JsonValue::String(s)) => matches!(
            s.trim().to_ascii_uppercase().as_str(),
            "YES" | "Y" | "TRUE" | "T" | "1"
        ),
        _ => false,
    }
}

/// One vendor connection plus the SQL surface of its engine.
///
/// All SQL handed to a driver uses `?` placeholders; the driver rewrites
/// them through its [`StatementCache`].
#[async_trait]
pub trait Driver: Send + std::fmt::Debug {
    fn kind(&self) -> DriverKind;

    fn dialect(&self) -> &dyn Dialect;

    fn parameters(&self) -> &ConnectionParameters;

    fn is_connected(&self) -> bool;

    /// Server version read right after connecting.
    fn server_version(&self) -> Option<&str>;

    /// Open the vendor connection and tune the dialect to the server version.
    async fn connect(&mut self) -> DbResult<()>;

    async fn close(&mut self) -> DbResult<()>;

    /// Run a query and decode every row.
    async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;

    /// Run a statement, returning the affected row count.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    /// Run a parameterless statement without preparing it.
    async fn execute_raw(&mut self, sql: &str) -> DbResult<()>;

    /// Close every prepared statement held by the vendor session.
    async fn flush_prepared_statements(&mut self) -> DbResult<()>;

    async fn begin(&mut self) -> DbResult<()> {
        let sql = self.dialect().begin_sql();
        self.execute_raw(sql).await
    }

    async fn commit(&mut self) -> DbResult<()> {
        let sql = self.dialect().commit_sql();
        self.execute_raw(sql).await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let sql = self.dialect().rollback_sql();
        self.execute_raw(sql).await
    }

    /// Whether a transaction opened through [`Driver::begin`] is still open.
    fn in_transaction(&self) -> bool {
        false
    }

    /// Run dependent DDL statements as one unit on engines that can roll
    /// DDL back.
    ///
    /// Inside an open transaction the steps run under [`DDL_SAVEPOINT`];
    /// otherwise they get a transaction of their own. Other engines run the
    /// statements one after another.
    async fn execute_ddl_steps(&mut self, statements: &[String]) -> DbResult<()> {
        if statements.len() < 2 || !self.dialect().transactional_ddl() {
            for sql in statements {
                self.execute(sql, &[]).await?;
            }
            return Ok(());
        }

        let nested = self.in_transaction();
        if nested {
            let savepoint = self.dialect().savepoint_sql(DDL_SAVEPOINT);
            self.execute_raw(&savepoint).await?;
        } else {
            self.begin().await?;
        }

        let mut outcome = Ok(());
        for sql in statements {
            if let Err(err) = self.execute(sql, &[]).await {
                outcome = Err(err);
                break;
            }
        }

        match outcome {
            Ok(()) if nested => {
                let release = self.dialect().release_savepoint_sql(DDL_SAVEPOINT);
                match release {
                    Some(sql) => self.execute_raw(&sql).await,
                    None => Ok(()),
                }
            }
            Ok(()) => self.commit().await,
            Err(err) => {
                tracing::warn!(
                    driver = %self.kind(),
                    error = %err,
                    "DDL step failed, rolling back"
                );
                let undo = if nested {
                    let rollback = self.dialect().rollback_to_savepoint_sql(DDL_SAVEPOINT);
                    self.execute_raw(&rollback).await
                } else {
                    self.rollback().await
                };
                if let Err(e) = undo {
                    tracing::warn!(error = %e, "Rolling back DDL steps failed");
                }
                Err(err)
            }
        }
    }

    fn db_info(&self) -> DbInfo {
        let params = self.parameters();
        DbInfo {
            driver: self.kind(),
            version: self.server_version().map(str::to_string),
            database: params.database().to_string(),
            host: params.host().to_string(),
            extras: BTreeMap::new(),
        }
    }

    /// Base table names starting with `prefix`.
    async fn list_tables(&mut self, prefix: &str) -> DbResult<Vec<String>> {
        let sql = self.dialect().list_tables_sql();
        let pattern = QueryParam::String(format!("{prefix}%"));
        let rows = self.fetch(sql, std::slice::from_ref(&pattern)).await?;
        // `_` is a LIKE wildcard, so the engine's match is only a pre-filter
        Ok(rows
            .iter()
            .filter_map(|row| json_to_string(row.get("table_name")))
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    /// Introspect a table; `None` when it does not exist.
    async fn table_information(&mut self, table: &str) -> DbResult<Option<Table>>;

    /// Insert or update one row keyed by `primary_columns`.
    async fn insert_or_update(
        &mut self,
        table: &str,
        columns: &[&str],
        values: &[QueryParam],
        primary_columns: &[&str],
    ) -> DbResult<u64> {
        let upsert = self.dialect().upsert_sql(table, columns, primary_columns);
        match upsert {
            Some(upsert) => {
                let params = upsert.bind_values(values);
                self.execute(&upsert.sql, &params).await
            }
            None => {
                self.check_then_write(table, columns, values, primary_columns)
                    .await
            }
        }
    }

    /// Upsert by counting key matches, then updating or inserting.
    ///
    /// Not safe against a concurrent writer inserting the same key between
    /// the count and the insert.
    async fn check_then_write(
        &mut self,
        table: &str,
        columns: &[&str],
        values: &[QueryParam],
        primary_columns: &[&str],
    ) -> DbResult<u64> {
        let mut key_values = Vec::with_capacity(primary_columns.len());
        for key in primary_columns {
            let position = columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(key))
                .ok_or_else(|| {
                    DbError::invalid_input(format!("primary column {key} has no value"))
                })?;
            let value = values.get(position).cloned().ok_or_else(|| {
                DbError::invalid_input(format!("primary column {key} has no value"))
            })?;
            key_values.push(value);
        }

        let count_sql = self.dialect().count_sql(table, primary_columns);
        let rows = self.fetch(&count_sql, &key_values).await?;
        let exists = json_to_u64(rows.first().and_then(|r| r.get("cnt"))) > 0;

        if exists {
            let (update_columns, mut params): (Vec<&str>, Vec<QueryParam>) = columns
                .iter()
                .zip(values)
                .filter(|(c, _)| !is_key(c, primary_columns))
                .map(|(c, v)| (*c, v.clone()))
                .unzip();
            if update_columns.is_empty() {
                return Ok(0);
            }
            params.extend(key_values);
            let sql = self
                .dialect()
                .update_sql(table, &update_columns, primary_columns);
            self.execute(&sql, &params).await
        } else {
            let sql = self.dialect().insert_sql(table, columns);
            self.execute(&sql, values).await
        }
    }

    /// Insert many rows, chunked by [`Dialect::max_rows_per_statement`].
    async fn multi_insert(
        &mut self,
        table: &str,
        columns: &[&str],
        value_sets: &[Vec<QueryParam>],
    ) -> DbResult<u64> {
        let rows_per_statement = self.dialect().max_rows_per_statement(columns.len());
        let mut affected = 0;
        for chunk in value_sets.chunks(rows_per_statement) {
            let sql = self.dialect().multi_insert_sql(table, columns, chunk.len());
            let params: Vec<QueryParam> = chunk.iter().flatten().cloned().collect();
            affected += self.execute(&sql, &params).await?;
        }
        Ok(affected)
    }

    async fn create_table(&mut self, table: &Table) -> DbResult<()> {
        let statements = self.dialect().create_table_sql(table);
        for sql in statements {
            self.execute(&sql, &[]).await?;
        }
        Ok(())
    }

    /// Rename and/or retype `old_column` into `column`, atomically where
    /// the engine allows it.
    async fn change_column(
        &mut self,
        table: &str,
        old_column: &str,
        column: &TableColumn,
    ) -> DbResult<()> {
        let statements = self
            .dialect()
            .change_column_sql(table, old_column, column)
            .ok_or_else(|| {
                DbError::invalid_input(format!("{} cannot change columns", self.kind()))
            })?;
        self.execute_ddl_steps(&statements).await
    }

    async fn remove_column(&mut self, table: &str, column: &str) -> DbResult<()> {
        let sql = self
            .dialect()
            .remove_column_sql(table, column)
            .ok_or_else(|| {
                DbError::invalid_input(format!("{} cannot remove columns", self.kind()))
            })?;
        self.execute(&sql, &[]).await.map(|_| ())
    }

    /// Export `tables` (every table when empty) to `path`.
    async fn dump(&mut self, path: &Path, tables: &[String]) -> DbResult<()>;

    /// Import a file produced by [`Driver::dump`].
    async fn restore(&mut self, path: &Path) -> DbResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySqlDialect, PostgresDialect, SqlServerDialect, SqliteDialect};
    use crate::models::DataType;

    #[test]
    fn test_statement_cache_reuses_entries() {
        let dialect = PostgresDialect::default();
        let mut cache = StatementCache::default();
        let a = cache.prepare("SELECT * FROM t WHERE a = ? AND b = ?", &dialect);
        assert_eq!(a.sql, "SELECT * FROM t WHERE a = $1 AND b = $2");
        assert_eq!(a.placeholders, 2);
        let b = cache.prepare("SELECT * FROM t WHERE a = ? AND b = ?", &dialect);
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
        assert!(!cache.take_pending_flush());
    }

    #[test]
    fn test_statement_cache_flushes_when_full() {
        let mut cache = StatementCache::with_limit(3);
        for i in 0..3 {
            cache.prepare(&format!("SELECT {i}"), &MySqlDialect);
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.take_pending_flush());

        cache.prepare("SELECT 99", &MySqlDialect);
        assert_eq!(cache.len(), 1);
        assert!(cache.take_pending_flush());
        assert!(!cache.take_pending_flush());
    }

    #[test]
    fn test_mysql_backslash_escape_keeps_literal_closed() {
        let mut cache = StatementCache::default();
        let prepared = cache.prepare(r"SELECT 'it\'s' AS a, ? AS b", &MySqlDialect);
        assert_eq!(prepared.placeholders, 1);
        assert!(prepared.check_params(&[QueryParam::Int(1)]).is_ok());

        // Standard quoting ends the literal at the backslash
        let prepared = cache.prepare(r"SELECT 'C:\' AS a, ? AS b", &SqliteDialect::default());
        assert_eq!(prepared.sql, r"SELECT 'C:\' AS a, ?1 AS b");
    }

    #[test]
    fn test_param_count_mismatch() {
        let prepared = PreparedSql {
            sql: "SELECT ?1".into(),
            placeholders: 1,
        };
        assert!(prepared.check_params(&[QueryParam::Int(1)]).is_ok());
        let err = prepared.check_params(&[]).unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
    }

    #[derive(Debug)]
    struct RecordingDriver {
        params: ConnectionParameters,
        dialect: Box<dyn Dialect>,
        in_transaction: bool,
        fail_when: &'static str,
        log: Vec<String>,
    }

    impl RecordingDriver {
        fn new(dialect: Box<dyn Dialect>, in_transaction: bool, fail_when: &'static str) -> Self {
            Self {
                params: ConnectionParameters::new("sqlite", "", "", "", ":memory:"),
                dialect,
                in_transaction,
                fail_when,
                log: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        fn kind(&self) -> DriverKind {
            self.dialect.kind()
        }

        fn dialect(&self) -> &dyn Dialect {
            self.dialect.as_ref()
        }

        fn parameters(&self) -> &ConnectionParameters {
            &self.params
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn server_version(&self) -> Option<&str> {
            None
        }

        async fn connect(&mut self) -> DbResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> DbResult<()> {
            Ok(())
        }

        async fn fetch(&mut self, _sql: &str, _params: &[QueryParam]) -> DbResult<Vec<Row>> {
            Ok(Vec::new())
        }

        async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
            self.log.push(sql.to_string());
            if !self.fail_when.is_empty() && sql.contains(self.fail_when) {
                return Err(DbError::query("statement failed", None));
            }
            Ok(0)
        }

        async fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
            self.log.push(sql.to_string());
            Ok(())
        }

        async fn flush_prepared_statements(&mut self) -> DbResult<()> {
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            self.in_transaction
        }

        async fn table_information(&mut self, _table: &str) -> DbResult<Option<Table>> {
            Ok(None)
        }

        async fn dump(&mut self, _path: &Path, _tables: &[String]) -> DbResult<()> {
            Ok(())
        }

        async fn restore(&mut self, _path: &Path) -> DbResult<()> {
            Ok(())
        }
    }

    fn renamed_bigint() -> TableColumn {
        TableColumn::new("total", DataType::BigInt)
    }

    #[tokio::test]
    async fn test_change_column_rolls_back_failed_step() {
        let mut driver =
            RecordingDriver::new(Box::new(PostgresDialect::default()), false, " TYPE ");
        let err = driver
            .change_column("t", "amount", &renamed_bigint())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));

        assert_eq!(driver.log.len(), 4, "{:?}", driver.log);
        assert_eq!(driver.log[0], "BEGIN");
        assert!(driver.log[1].contains("RENAME COLUMN"));
        assert!(driver.log[2].contains(" TYPE "));
        assert_eq!(driver.log[3], "ROLLBACK");
    }

    #[tokio::test]
    async fn test_change_column_commits_on_success() {
        let mut driver = RecordingDriver::new(Box::new(PostgresDialect::default()), false, "");
        driver
            .change_column("t", "amount", &renamed_bigint())
            .await
            .unwrap();

        assert_eq!(driver.log.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(driver.log.last().map(String::as_str), Some("COMMIT"));
        assert_eq!(driver.log.len(), 5);
    }

    #[tokio::test]
    async fn test_change_column_uses_savepoint_inside_transaction() {
        let mut driver =
            RecordingDriver::new(Box::new(PostgresDialect::default()), true, "NOT NULL");
        driver
            .change_column("t", "amount", &renamed_bigint())
            .await
            .unwrap_err();
        assert_eq!(driver.log[0], "SAVEPOINT \"agp_ddl\"");
        assert_eq!(
            driver.log.last().map(String::as_str),
            Some("ROLLBACK TO SAVEPOINT \"agp_ddl\"")
        );
        assert!(!driver.log.iter().any(|sql| sql == "BEGIN" || sql == "ROLLBACK"));

        let mut driver = RecordingDriver::new(Box::new(SqlServerDialect), true, "");
        driver
            .change_column("t", "amount", &renamed_bigint())
            .await
            .unwrap();
        assert_eq!(driver.log[0], "SAVE TRANSACTION agp_ddl");
        assert!(driver.log[1].starts_with("EXEC sp_rename"));
        // SQL Server savepoints have no release statement
        assert_eq!(driver.log.len(), 3);
    }

    #[tokio::test]
    async fn test_change_column_sql_server_rolls_back() {
        let mut driver = RecordingDriver::new(Box::new(SqlServerDialect), false, "ALTER TABLE");
        driver
            .change_column("t", "amount", &renamed_bigint())
            .await
            .unwrap_err();
        assert_eq!(driver.log[0], "BEGIN TRANSACTION");
        assert_eq!(
            driver.log.last().map(String::as_str),
            Some("ROLLBACK TRANSACTION")
        );
    }

    #[tokio::test]
    async fn test_single_ddl_statement_is_not_wrapped() {
        let mut driver = RecordingDriver::new(Box::new(PostgresDialect::default()), false, "");
        driver
            .execute_ddl_steps(&["ALTER TABLE t ADD COLUMN c INT".to_string()])
            .await
            .unwrap();
        assert_eq!(driver.log, vec!["ALTER TABLE t ADD COLUMN c INT"]);

        let mut driver = RecordingDriver::new(Box::new(MySqlDialect), false, "");
        let steps = vec!["ALTER TABLE a".to_string(), "ALTER TABLE b".to_string()];
        driver.execute_ddl_steps(&steps).await.unwrap();
        assert_eq!(driver.log, steps);
    }

    #[test]
    fn test_json_helpers() {
        assert_eq!(json_to_u64(Some(&JsonValue::from(3))), 3);
        assert_eq!(json_to_u64(Some(&JsonValue::from("12"))), 12);
        assert_eq!(json_to_u64(Some(&JsonValue::from(2.0))), 2);
        assert_eq!(json_to_u64(None), 0);
        assert!(json_to_bool(Some(&JsonValue::from("YES"))));
        assert!(!json_to_bool(Some(&JsonValue::from("NO"))));
        assert!(json_to_bool(Some(&JsonValue::from(1))));
        assert_eq!(
            json_to_string(Some(&JsonValue::from(5))),
            Some("5".to_string())
        );
    }
}
