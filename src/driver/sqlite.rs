//! SQLite driver (sqlx).
//!
//! SQLite cannot alter or drop a column in place, so `change_column` and
//! `remove_column` rebuild the table through a shadow copy inside a
//! savepoint. Dump and restore copy the database file.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection as _, Executor};
use tracing::{debug, info, warn};

use super::dump::{ToolCommand, dump_to_file, wants_gzip};
use super::{
    DbInfo, Driver, PreparedSql, StatementCache, json_to_bool, json_to_string, json_to_u64,
    query_failure,
};
use crate::config::{ATTR_CREATE, ConnectionParameters};
use crate::db::params::bind_sqlite_param;
use crate::db::types::RowToJson;
use crate::dialect::{Dialect, SqliteDialect};
use crate::error::{DbError, DbResult};
use crate::models::{DriverKind, QueryParam, Row, Table, TableColumn, TableIndex, TableKey};

const SHADOW_SAVEPOINT: &str = "agp_shadow_rebuild";

#[derive(Debug)]
pub struct SqliteDriver {
    params: ConnectionParameters,
    dialect: SqliteDialect,
    conn: Option<SqliteConnection>,
    statements: StatementCache,
    version: Option<String>,
}

impl SqliteDriver {
    pub fn new(params: ConnectionParameters) -> Self {
        Self {
            params,
            dialect: SqliteDialect::default(),
            conn: None,
            statements: StatementCache::default(),
            version: None,
        }
    }

    fn connection(&mut self) -> DbResult<&mut SqliteConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::connection("SQLite connection is not open", "Connect first"))
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

    /// Create the shadow table, copy rows, swap it in and recreate indexes.
    async fn run_shadow_steps(&mut self, table: &str, plan: &ShadowPlan) -> DbResult<()> {
        let mut statements = self.dialect.create_table_sql(&plan.shadow);
        let pairs: Vec<(&str, &str)> = plan
            .copy
            .iter()
            .map(|(t, s)| (t.as_str(), s.as_str()))
            .collect();
        statements.push(
            self.dialect
                .copy_rows_sql(table, &plan.shadow.name, &pairs),
        );
        statements.push(self.dialect.drop_table_sql(table));
        statements.push(self.dialect.rename_table_sql(&plan.shadow.name, table));
        statements.extend(
            plan.indexes
                .iter()
                .map(|index| self.dialect.create_index_sql(table, index)),
        );

        for sql in statements {
            self.execute(&sql, &[]).await?;
        }
        Ok(())
    }

    async fn rebuild_table(&mut self, table: &str, change: ColumnChange<'_>) -> DbResult<()> {
        let current = self
            .table_information(table)
            .await?
            .ok_or_else(|| DbError::table_not_found(table))?;
        let plan = ShadowPlan::build(&current, change, self.dialect.shadow_table_name(table))?;
        debug!(table, shadow = %plan.shadow.name, "Rebuilding table through shadow copy");

        let savepoint = self.dialect.savepoint_sql(SHADOW_SAVEPOINT);
        self.execute_raw(&savepoint).await?;

        // SQLite always has a release statement
        let release = self
            .dialect
            .release_savepoint_sql(SHADOW_SAVEPOINT)
            .unwrap_or_default();
        match self.run_shadow_steps(table, &plan).await {
            Ok(()) => self.execute_raw(&release).await,
            Err(err) => {
                warn!(table, error = %err, "Shadow rebuild failed, rolling back");
                let rollback = self.dialect.rollback_to_savepoint_sql(SHADOW_SAVEPOINT);
                if let Err(e) = self.execute_raw(&rollback).await {
                    warn!(error = %e, "Rollback to savepoint failed");
                }
                if let Err(e) = self.execute_raw(&release).await {
                    warn!(error = %e, "Releasing savepoint failed");
                }
                Err(err)
            }
        }
    }
}

/// Column mutation applied by a shadow rebuild.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ColumnChange<'a> {
    Change {
        old_column: &'a str,
        column: &'a TableColumn,
    },
    Remove(&'a str),
}

/// Everything a shadow rebuild needs, derived from the current table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ShadowPlan {
    /// New layout under the shadow name, without secondary indexes
    pub shadow: Table,
    /// `(shadow column, source column)` pairs
    pub copy: Vec<(String, String)>,
    /// Secondary indexes to recreate on the renamed table
    pub indexes: Vec<TableIndex>,
}

impl ShadowPlan {
    pub fn build(current: &Table, change: ColumnChange<'_>, shadow_name: String) -> DbResult<Self> {
        let target = match change {
            ColumnChange::Change { old_column, .. } | ColumnChange::Remove(old_column) => {
                old_column
            }
        };
        if !current.has_column(target) {
            return Err(DbError::invalid_input(format!(
                "column {target} does not exist in {}",
                current.name
            )));
        }

        let mut shadow = Table::new(shadow_name);
        let mut copy = Vec::new();
        for column in &current.columns {
            let is_target = column.name.eq_ignore_ascii_case(target);
            match change {
                ColumnChange::Change { column: new, .. } if is_target => {
                    let new = new.clone().with_nullable(new.nullable && column.nullable);
                    copy.push((new.name.clone(), column.name.clone()));
                    shadow.columns.push(new);
                }
                ColumnChange::Remove(_) if is_target => {}
                _ => {
                    // Untouched columns keep their declared vendor type
                    copy.push((column.name.clone(), column.name.clone()));
                    shadow.columns.push(column.clone().with_data_type(None));
                }
            }
        }
        if shadow.columns.is_empty() {
            return Err(DbError::invalid_input(format!(
                "cannot remove the last column of {}",
                current.name
            )));
        }

        let rename = |name: &str| -> Option<String> {
            if !name.eq_ignore_ascii_case(target) {
                return Some(name.to_string());
            }
            match change {
                ColumnChange::Change { column, .. } => Some(column.name.clone()),
                ColumnChange::Remove(_) => None,
            }
        };

        shadow.keys = current
            .keys
            .iter()
            .filter_map(|k| rename(&k.column).map(TableKey::new))
            .collect();

        let indexes = current
            .indexes
            .iter()
            .filter_map(|index| {
                let columns = index
                    .columns()
                    .into_iter()
                    .map(&rename)
                    .collect::<Option<Vec<_>>>()?;
                Some(TableIndex::on_columns(index.name.clone(), &columns).unique(index.unique))
            })
            .collect();

        Ok(Self {
            shadow,
            copy,
            indexes,
        })
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
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

        let options = if self.params.is_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            let path = self.params.sqlite_path();
            let create = self.params.bool_attribute(ATTR_CREATE, true);
            if !create && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(DbError::connection(
                    format!("SQLite database {} does not exist", path.display()),
                    "Check the base_path attribute or set create=true",
                ));
            }
            SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(create)
        };

        let conn = options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to open {}: {e}", self.params.masked_url()),
                "Check that the base path exists and is writable",
            )
        })?;
        self.conn = Some(conn);

        let version_sql = self.dialect.version_sql();
        let rows = self.fetch(version_sql, &[]).await?;
        let version = rows
            .first()
            .and_then(|row| json_to_string(row.values().next()))
            .unwrap_or_default();
        self.dialect.set_server_version(&version);
        info!(
            url = %self.params.masked_url(),
            version = %version,
            multi_values = self.dialect.supports_multi_values(),
            "Connected to SQLite"
        );
        self.version = Some(version);
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        self.statements.clear();
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
            info!(url = %self.params.masked_url(), "SQLite connection closed");
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
                query = bind_sqlite_param(query, param);
            }
            query.fetch_all(&mut *conn).await
        };
        result
            .map(|rows| rows.iter().map(RowToJson::to_row).collect())
            .map_err(|e| query_failure(e.into(), sql, params, &self.dialect))
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let prepared = self.prepare(sql, params).await?;
        let conn = self.connection()?;
        let result = if params.is_empty() {
            conn.execute(prepared.sql.as_str()).await
        } else {
            let mut query = sqlx::query(&prepared.sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            query.execute(&mut *conn).await
        };
        result
            .map(|r| r.rows_affected())
            .map_err(|e| query_failure(e.into(), sql, params, &self.dialect))
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

    fn db_info(&self) -> DbInfo {
        let mut extras = std::collections::BTreeMap::new();
        let path = if self.params.is_memory() {
            ":memory:".to_string()
        } else {
            self.params.sqlite_path().display().to_string()
        };
        extras.insert("path".to_string(), path);
        extras.insert(
            "multi_values".to_string(),
            self.dialect.supports_multi_values().to_string(),
        );
        DbInfo {
            driver: DriverKind::Sqlite,
            version: self.version.clone(),
            database: self.params.database().to_string(),
            host: String::new(),
            extras,
        }
    }

    async fn table_information(&mut self, table: &str) -> DbResult<Option<Table>> {
        let quoted = self.dialect.quote_identifier(table);
        let columns = self
            .fetch(&format!("PRAGMA table_info({quoted})"), &[])
            .await?;
        if columns.is_empty() {
            return Ok(None);
        }

        let mut info = Table::new(table);
        let mut keys = Vec::new();
        for row in &columns {
            let name = json_to_string(row.get("name")).unwrap_or_default();
            let type_sql = json_to_string(row.get("type")).unwrap_or_default();
            let not_null = json_to_bool(row.get("notnull"));
            let key_position = json_to_u64(row.get("pk"));
            if key_position > 0 {
                keys.push((key_position, name.clone()));
            }
            info.columns
                .push(TableColumn::introspected(name, type_sql, !not_null));
        }
        keys.sort();
        info.keys = keys.into_iter().map(|(_, k)| TableKey::new(k)).collect();

        let index_rows = self
            .fetch(&format!("PRAGMA index_list({quoted})"), &[])
            .await?;
        for index_row in &index_rows {
            // Only explicitly created indexes; `pk`/`u` are constraint indexes
            let origin = json_to_string(index_row.get("origin")).unwrap_or_else(|| "c".into());
            if origin != "c" {
                continue;
            }
            let Some(name) = json_to_string(index_row.get("name")) else {
                continue;
            };
            let unique = json_to_bool(index_row.get("unique"));

            let quoted_index = self.dialect.quote_identifier(&name);
            let mut index_columns: Vec<(u64, String)> = self
                .fetch(&format!("PRAGMA index_info({quoted_index})"), &[])
                .await?
                .iter()
                .filter_map(|row| {
                    json_to_string(row.get("name")).map(|c| (json_to_u64(row.get("seqno")), c))
                })
                .collect();
            index_columns.sort();
            let names: Vec<String> = index_columns.into_iter().map(|(_, c)| c).collect();
            info.indexes
                .push(TableIndex::on_columns(name, &names).unique(unique));
        }

        Ok(Some(info))
    }

    async fn change_column(
        &mut self,
        table: &str,
        old_column: &str,
        column: &TableColumn,
    ) -> DbResult<()> {
        self.rebuild_table(table, ColumnChange::Change { old_column, column })
            .await
    }

    async fn remove_column(&mut self, table: &str, column: &str) -> DbResult<()> {
        self.rebuild_table(table, ColumnChange::Remove(column)).await
    }

    async fn dump(&mut self, path: &Path, tables: &[String]) -> DbResult<()> {
        if self.params.is_memory() {
            return Err(DbError::invalid_input("an in-memory database cannot be dumped"));
        }
        if !tables.is_empty() {
            debug!(tables = tables.len(), "SQLite dumps always copy the whole file");
        }

        let source = self.params.sqlite_path();
        // The file must be quiescent while it is copied
        self.close().await?;

        if wants_gzip(&self.params, path) {
            let tool = ToolCommand::new("gzip")
                .arg("-c")
                .arg(source.display().to_string());
            dump_to_file(&tool, path, false).await?;
        } else {
            tokio::fs::copy(&source, path)
                .await
                .map_err(|e| DbError::dump("copy", e.to_string()))?;
        }
        info!(source = %source.display(), target = %path.display(), "SQLite database dumped");
        Ok(())
    }

    async fn restore(&mut self, path: &Path) -> DbResult<()> {
        if self.params.is_memory() {
            return Err(DbError::invalid_input("an in-memory database cannot be restored"));
        }

        let target = self.params.sqlite_path();
        self.close().await?;

        if wants_gzip(&self.params, path) {
            let tool = ToolCommand::new("gunzip")
                .arg("-c")
                .arg(path.display().to_string());
            dump_to_file(&tool, &target, false).await?;
        } else {
            tokio::fs::copy(path, &target)
                .await
                .map_err(|e| DbError::dump("copy", e.to_string()))?;
        }
        info!(source = %path.display(), target = %target.display(), "SQLite database restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataType;

    fn sample_table() -> Table {
        Table::new("agp_t")
            .with_column(TableColumn::introspected("id", "INTEGER", false))
            .with_column(TableColumn::introspected("old_int", "INTEGER", true))
            .with_column(TableColumn::introspected("label", "VARCHAR(30)", true))
            .with_key("id")
            .with_index(TableIndex::on_columns("ix_label", &["label", "old_int"]))
            .with_index(TableIndex::on_columns("ix_label_only", &["label"]).unique(true))
    }

    #[test]
    fn test_shadow_plan_change() {
        let new = TableColumn::new("new_bigint", DataType::BigInt);
        let plan = ShadowPlan::build(
            &sample_table(),
            ColumnChange::Change {
                old_column: "old_int",
                column: &new,
            },
            "agp_t_shadow".into(),
        )
        .unwrap();

        assert_eq!(plan.shadow.name, "agp_t_shadow");
        assert_eq!(
            plan.shadow.column_names(),
            vec!["id", "new_bigint", "label"]
        );
        assert_eq!(plan.shadow.columns[1].data_type, Some(DataType::BigInt));
        // Untouched columns keep their declared type
        assert_eq!(plan.shadow.columns[2].data_type, None);
        assert_eq!(plan.shadow.columns[2].type_sql, "VARCHAR(30)");
        assert_eq!(
            plan.copy[1],
            ("new_bigint".to_string(), "old_int".to_string())
        );
        assert_eq!(plan.shadow.primary_columns(), vec!["id"]);
        assert_eq!(plan.indexes[0].description, "label,new_bigint");
        assert!(plan.indexes[1].unique);
    }

    #[test]
    fn test_shadow_plan_remove_drops_dependent_indexes() {
        let plan = ShadowPlan::build(
            &sample_table(),
            ColumnChange::Remove("old_int"),
            "agp_t_shadow".into(),
        )
        .unwrap();
        assert_eq!(plan.shadow.column_names(), vec!["id", "label"]);
        assert_eq!(plan.indexes.len(), 1);
        assert_eq!(plan.indexes[0].name, "ix_label_only");
    }

    #[test]
    fn test_shadow_plan_rejects_missing_column() {
        let err = ShadowPlan::build(
            &sample_table(),
            ColumnChange::Remove("nope"),
            "agp_t_shadow".into(),
        )
        .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_memory_connection_reads_version() {
        let mut driver = SqliteDriver::new(ConnectionParameters::new(
            "sqlite", "", "", "", ":memory:",
        ));
        driver.connect().await.unwrap();
        assert!(driver.is_connected());
        assert!(driver.server_version().is_some_and(|v| v.starts_with('3')));
        assert!(driver.dialect.supports_multi_values());

        let rows = driver
            .fetch("SELECT ? AS a, ? AS b", &[QueryParam::Int(1), QueryParam::from("x")])
            .await
            .unwrap();
        assert_eq!(rows[0]["a"], serde_json::json!(1));
        assert_eq!(rows[0]["b"], serde_json::json!("x"));

        let err = driver.fetch("SELECT ?", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
        driver.close().await.unwrap();
        assert!(!driver.is_connected());
    }

    #[tokio::test]
    async fn test_union_all_insert_stays_under_compound_limit() {
        let mut driver = SqliteDriver::new(ConnectionParameters::new(
            "sqlite", "", "", "", ":memory:",
        ));
        driver.connect().await.unwrap();
        driver.dialect.set_server_version("3.7.10");
        assert!(!driver.dialect.supports_multi_values());

        driver
            .execute_raw("CREATE TABLE agp_many (a INTEGER)")
            .await
            .unwrap();
        let rows: Vec<Vec<QueryParam>> = (0..600).map(|i| vec![QueryParam::Int(i)]).collect();
        driver.multi_insert("agp_many", &["a"], &rows).await.unwrap();

        let counted = driver
            .fetch("SELECT COUNT(*) AS cnt FROM agp_many", &[])
            .await
            .unwrap();
        assert_eq!(counted[0]["cnt"], serde_json::json!(600));
        driver.close().await.unwrap();
    }
}
