//! PostgreSQL driver (sqlx).

use std::path::Path;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection as _, Executor};
use tracing::info;

use super::dump::{ToolCommand, dump_to_file, restore_from_file, tool_binary, wants_gzip};
use super::{
    DbInfo, Driver, PreparedSql, StatementCache, json_to_bool, json_to_string, query_failure,
};
use crate::config::{ATTR_DUMP_BIN, ATTR_RESTORE_BIN, ConnectionParameters};
use crate::db::params::bind_postgres_param;
use crate::db::types::RowToJson;
use crate::dialect::{Dialect, PostgresDialect};
use crate::error::{DbError, DbResult};
use crate::models::{DriverKind, QueryParam, Row, Table, TableColumn, TableIndex, TableKey};

mod queries {
    pub const COLUMNS: &str = r#"
        SELECT
            a.attname::text AS column_name,
            format_type(a.atttypid, a.atttypmod) AS column_type,
            NOT a.attnotnull AS is_nullable
        FROM pg_attribute a
        JOIN pg_class c ON c.oid = a.attrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = current_schema()
        AND c.relname = ?
        AND a.attnum > 0
        AND NOT a.attisdropped
        ORDER BY a.attnum
        "#;

    pub const PRIMARY_KEY: &str = r#"
        SELECT a.attname::text AS column_name
        FROM pg_index ix
        JOIN pg_class c ON c.oid = ix.indrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname = current_schema()
        AND c.relname = ?
        AND ix.indisprimary
        ORDER BY array_position(ix.indkey::int2[], a.attnum)
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            i.relname::text AS index_name,
            string_agg(a.attname::text, ',' ORDER BY array_position(ix.indkey::int2[], a.attnum)) AS column_names,
            ix.indisunique AS is_unique
        FROM pg_index ix
        JOIN pg_class c ON c.oid = ix.indrelid
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname = current_schema()
        AND c.relname = ?
        AND NOT ix.indisprimary
        GROUP BY i.relname, ix.indisunique
        ORDER BY i.relname
        "#;
}

#[derive(Debug)]
pub struct PostgresDriver {
    params: ConnectionParameters,
    dialect: PostgresDialect,
    conn: Option<PgConnection>,
    statements: StatementCache,
    version: Option<String>,
    in_transaction: bool,
}

impl PostgresDriver {
    pub fn new(params: ConnectionParameters) -> Self {
        Self {
            params,
            dialect: PostgresDialect::default(),
            conn: None,
            statements: StatementCache::default(),
            version: None,
            in_transaction: false,
        }
    }

    fn connection(&mut self) -> DbResult<&mut PgConnection> {
        self.conn.as_mut().ok_or_else(|| {
            DbError::connection("PostgreSQL connection is not open", "Connect first")
        })
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

    /// `pg_dump`/`psql` with the shared connection flags.
    fn client_tool(&self, attribute: &str, default: &str) -> ToolCommand {
        let mut tool = ToolCommand::new(tool_binary(&self.params, attribute, default))
            .arg(format!("--host={}", self.params.host()))
            .arg(format!("--username={}", self.params.username()))
            .arg(format!("--dbname={}", self.params.database()))
            .arg("--no-password")
            .env("PGPASSWORD", self.params.password());
        if let Some(port) = self.params.effective_port() {
            tool = tool.arg(format!("--port={port}"));
        }
        tool
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
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

        let mut options = PgConnectOptions::new()
            .host(self.params.host())
            .username(self.params.username())
            .password(self.params.password())
            .database(self.params.database())
            .application_name("agp-dal");
        if let Some(port) = self.params.effective_port() {
            options = options.port(port);
        }

        let conn = options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to connect to {}: {e}", self.params.masked_url()),
                "Check host, port, credentials and pg_hba.conf",
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
        info!(url = %self.params.masked_url(), version = %version, "Connected to PostgreSQL");
        self.version = Some(version);
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        self.statements.clear();
        self.in_transaction = false;
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
            info!(url = %self.params.masked_url(), "PostgreSQL connection closed");
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
                query = bind_postgres_param(query, param);
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
                query = bind_postgres_param(query, param);
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

    fn db_info(&self) -> DbInfo {
        let mut extras = std::collections::BTreeMap::new();
        if let Some(port) = self.params.effective_port() {
            extras.insert("port".to_string(), port.to_string());
        }
        DbInfo {
            driver: self.kind(),
            version: self.version.clone(),
            database: self.params.database().to_string(),
            host: self.params.host().to_string(),
            extras,
        }
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
                Some(TableIndex::new(index_name, columns).unique(json_to_bool(row.get("is_unique"))))
            })
            .collect();

        Ok(Some(info))
    }

    async fn dump(&mut self, path: &Path, tables: &[String]) -> DbResult<()> {
        let tool = self
            .client_tool(ATTR_DUMP_BIN, "pg_dump")
            .args(["--no-owner", "--clean", "--if-exists"])
            .args(tables.iter().map(|t| format!("--table={t}")));
        dump_to_file(&tool, path, wants_gzip(&self.params, path)).await?;
        info!(path = %path.display(), tables = tables.len(), "PostgreSQL dump complete");
        Ok(())
    }

    async fn restore(&mut self, path: &Path) -> DbResult<()> {
        let tool = self
            .client_tool(ATTR_RESTORE_BIN, "psql")
            .args(["--quiet", "--set=ON_ERROR_STOP=1"]);
        restore_from_file(&tool, path, wants_gzip(&self.params, path)).await?;
        info!(path = %path.display(), "PostgreSQL restore complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tool_keeps_password_in_env() {
        let params = ConnectionParameters::new("postgres", "pg.local", "agp", "s3cret", "agp");
        let driver = PostgresDriver::new(params);
        let tool = driver.client_tool(ATTR_DUMP_BIN, "pg_dump");
        assert_eq!(tool.program, "pg_dump");
        assert!(tool.args.contains(&"--port=5432".to_string()));
        assert!(tool.args.contains(&"--no-password".to_string()));
        assert!(!tool.args.iter().any(|a| a.contains("s3cret")));
        assert_eq!(tool.envs[0].0, "PGPASSWORD");
    }

    #[test]
    fn test_restore_binary_override() {
        let params = ConnectionParameters::new("pgsql", "localhost", "u", "p", "db")
            .with_attribute(ATTR_RESTORE_BIN, "/usr/lib/postgresql/16/bin/psql");
        let driver = PostgresDriver::new(params);
        let tool = driver.client_tool(ATTR_RESTORE_BIN, "psql");
        assert_eq!(tool.program, "/usr/lib/postgresql/16/bin/psql");
    }
}
