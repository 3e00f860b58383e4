//! Oracle driver (`oracle` crate, ODPI-C).
//!
//! The client library is synchronous, so every call runs on the blocking
//! pool. Oracle sessions never autocommit: outside an explicit transaction
//! each write is committed right after it succeeds. LOB columns are read
//! eagerly into strings or byte buffers.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use oracle::sql_type::{OracleType, ToSql};
use serde_json::Value as JsonValue;
use tracing::info;

use super::dump::{
    ToolCommand, compress_file, decompress_file, run_tool, strip_gz, tool_binary, wants_gzip,
};
use super::{DbInfo, Driver, PreparedSql, StatementCache, json_to_bool, json_to_string, query_failure};
use crate::config::{ATTR_DUMP_BIN, ATTR_RESTORE_BIN, ATTR_SERVICE, ConnectionParameters};
use crate::db::types::{DATETIME_FORMAT, decimal_to_json, decode_binary_value, float_to_json};
use crate::dialect::oracle::ROWNUM_COLUMN;
use crate::dialect::{Dialect, OracleDialect};
use crate::error::{DbError, DbResult};
use crate::models::{DriverKind, QueryParam, Row, Table, TableColumn, TableIndex, TableKey};

mod queries {
    pub const COLUMNS: &str = r#"
        SELECT
            LOWER(column_name) AS column_name,
            CASE
                WHEN data_type = 'NUMBER' AND data_precision IS NOT NULL
                    THEN 'NUMBER(' || data_precision || ',' || NVL(data_scale, 0) || ')'
                WHEN data_type IN ('VARCHAR2', 'NVARCHAR2', 'CHAR', 'NCHAR')
                    THEN data_type || '(' || char_length || ')'
                ELSE data_type
            END AS column_type,
            nullable AS is_nullable
        FROM user_tab_columns
        WHERE table_name = UPPER(?)
        ORDER BY column_id
        "#;

    pub const PRIMARY_KEY: &str = r#"
        SELECT LOWER(cc.column_name) AS column_name
        FROM user_constraints c
        JOIN user_cons_columns cc ON cc.constraint_name = c.constraint_name
        WHERE c.table_name = UPPER(?)
        AND c.constraint_type = 'P'
        ORDER BY cc.position
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            LOWER(i.index_name) AS index_name,
            LISTAGG(LOWER(ic.column_name), ',') WITHIN GROUP (ORDER BY ic.column_position) AS column_names,
            i.uniqueness AS uniqueness
        FROM user_indexes i
        JOIN user_ind_columns ic ON ic.index_name = i.index_name
        WHERE i.table_name = UPPER(?)
        AND i.index_name NOT IN (
            SELECT index_name FROM user_constraints
            WHERE table_name = UPPER(?) AND constraint_type = 'P' AND index_name IS NOT NULL
        )
        GROUP BY i.index_name, i.uniqueness
        ORDER BY i.index_name
        "#;
}

#[derive(Debug)]
pub struct OracleDriver {
    params: ConnectionParameters,
    dialect: OracleDialect,
    conn: Option<Arc<oracle::Connection>>,
    statements: StatementCache,
    version: Option<String>,
    in_transaction: bool,
}

impl OracleDriver {
    pub fn new(params: ConnectionParameters) -> Self {
        Self {
            params,
            dialect: OracleDialect::default(),
            conn: None,
            statements: StatementCache::default(),
            version: None,
            in_transaction: false,
        }
    }

    /// EZConnect string: `//host:port/service`.
    fn connect_string(&self) -> String {
        let service = self
            .params
            .attribute(ATTR_SERVICE)
            .unwrap_or(self.params.database());
        match self.params.effective_port() {
            Some(port) => format!("//{}:{port}/{service}", self.params.host()),
            None => format!("//{}/{service}", self.params.host()),
        }
    }

    fn connection(&self) -> DbResult<Arc<oracle::Connection>> {
        self.conn
            .clone()
            .ok_or_else(|| DbError::connection("Oracle connection is not open", "Connect first"))
    }

    fn prepare(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<PreparedSql> {
        let prepared = self.statements.prepare(sql, &self.dialect);
        // ODPI-C keeps its own statement cache keyed by SQL text
        self.statements.take_pending_flush();
        prepared
            .check_params(params)
            .map_err(|e| query_failure(e, sql, params, &self.dialect))?;
        Ok(prepared)
    }

    /// Run `f` against the session on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&oracle::Connection) -> oracle::Result<T> + Send + 'static,
    {
        let conn = self.connection()?;
        tokio::task::spawn_blocking(move || f(&conn))
            .await
            .map_err(|e| DbError::internal(format!("Oracle worker panicked: {e}")))?
            .map_err(oracle_error)
    }

    /// `exp`/`imp` credentials: `user/password@//host:port/service`.
    fn userid(&self) -> String {
        format!(
            "{}/{}@{}",
            self.params.username(),
            self.params.password(),
            self.connect_string()
        )
    }
}

/// Map an ODPI-C error, keeping the `ORA-NNNNN` code.
fn oracle_error(err: oracle::Error) -> DbError {
    let message = err.to_string();
    let code = message.find("ORA-").and_then(|pos| {
        let digits: String = message[pos + 4..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        (!digits.is_empty()).then(|| format!("ORA-{digits}"))
    });
    DbError::query(message, code)
}

fn to_sql_values(params: &[QueryParam]) -> Vec<Box<dyn ToSql>> {
    params
        .iter()
        .map(|param| -> Box<dyn ToSql> {
            match param {
                QueryParam::Null => Box::new(None::<String>),
                QueryParam::Bool(v) => Box::new(i64::from(*v)),
                QueryParam::Int(v) => Box::new(*v),
                QueryParam::Float(v) => Box::new(*v),
                QueryParam::String(v) => Box::new(v.clone()),
                QueryParam::Bytes(v) => Box::new(v.clone()),
            }
        })
        .collect()
}

fn decode_value(value: &oracle::SqlValue, oracle_type: &OracleType) -> JsonValue {
    let decoded = match oracle_type {
        OracleType::Number(_, _) | OracleType::Float(_) => value
            .get::<Option<String>>()
            .map(|v| v.map(decimal_to_json)),
        OracleType::BinaryFloat | OracleType::BinaryDouble => value
            .get::<Option<f64>>()
            .map(|v| v.map(float_to_json)),
        OracleType::Date | OracleType::Timestamp(_) => value
            .get::<Option<chrono::NaiveDateTime>>()
            .map(|v| v.map(|dt| JsonValue::String(dt.format(DATETIME_FORMAT).to_string()))),
        OracleType::BLOB | OracleType::Raw(_) | OracleType::LongRaw => value
            .get::<Option<Vec<u8>>>()
            .map(|v| v.map(|bytes| decode_binary_value(&bytes))),
        _ => value.get::<Option<String>>().map(|v| v.map(JsonValue::String)),
    };
    decoded.ok().flatten().unwrap_or(JsonValue::Null)
}

fn fetch_rows(
    conn: &oracle::Connection,
    sql: &str,
    params: &[QueryParam],
) -> oracle::Result<Vec<Row>> {
    let values = to_sql_values(params);
    let refs: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();
    let result_set = conn.query(sql, &refs)?;
    let columns: Vec<(String, OracleType)> = result_set
        .column_info()
        .iter()
        .map(|info| (info.name().to_lowercase(), info.oracle_type().clone()))
        .collect();

    let mut rows = Vec::new();
    for row in result_set {
        let row = row?;
        let mut map = Row::new();
        for ((name, oracle_type), value) in columns.iter().zip(row.sql_values()) {
            if name == ROWNUM_COLUMN {
                continue;
            }
            map.insert(name.clone(), decode_value(value, oracle_type));
        }
        rows.push(map);
    }
    Ok(rows)
}

#[async_trait]
impl Driver for OracleDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Oracle
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

        let username = self.params.username().to_string();
        let password = self.params.password().to_string();
        let connect_string = self.connect_string();
        let conn = tokio::task::spawn_blocking(move || {
            oracle::Connection::connect(username, password, connect_string)
        })
        .await
        .map_err(|e| DbError::internal(format!("Oracle worker panicked: {e}")))?
        .map_err(|e| {
            DbError::connection(
                format!("Failed to connect to {}: {e}", self.params.masked_url()),
                "Check the service name and that Oracle Instant Client is installed",
            )
        })?;
        self.conn = Some(Arc::new(conn));
        self.in_transaction = false;

        let version_sql = self.dialect.version_sql();
        let rows = self.fetch(version_sql, &[]).await?;
        let version = rows
            .first()
            .and_then(|row| json_to_string(row.values().next()))
            .unwrap_or_default();
        self.dialect.set_server_version(&version);
        info!(url = %self.params.masked_url(), version = %version, "Connected to Oracle");
        self.version = Some(version);
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        self.statements.clear();
        self.in_transaction = false;
        if let Some(conn) = self.conn.take() {
            tokio::task::spawn_blocking(move || conn.close())
                .await
                .map_err(|e| DbError::internal(format!("Oracle worker panicked: {e}")))?
                .map_err(oracle_error)?;
            info!(url = %self.params.masked_url(), "Oracle connection closed");
        }
        Ok(())
    }

    async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let prepared = self.prepare(sql, params)?;
        let owned = params.to_vec();
        self.blocking(move |conn| fetch_rows(conn, &prepared.sql, &owned))
            .await
            .map_err(|e| query_failure(e, sql, params, &self.dialect))
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let prepared = self.prepare(sql, params)?;
        let owned = params.to_vec();
        let autocommit = !self.in_transaction;
        self.blocking(move |conn| {
            let values = to_sql_values(&owned);
            let refs: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();
            let affected = conn.execute(&prepared.sql, &refs)?.row_count()?;
            if autocommit {
                conn.commit()?;
            }
            Ok(affected)
        })
        .await
        .map_err(|e| query_failure(e, sql, params, &self.dialect))
    }

    async fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        let owned = sql.to_string();
        self.blocking(move |conn| conn.execute(&owned, &[]).map(|_| ()))
            .await
            .map_err(|e| query_failure(e, sql, &[], &self.dialect))
    }

    async fn flush_prepared_statements(&mut self) -> DbResult<()> {
        self.statements.clear();
        Ok(())
    }

    async fn begin(&mut self) -> DbResult<()> {
        // Transactions start implicitly with the first write
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.in_transaction = false;
        self.blocking(|conn| conn.commit()).await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.in_transaction = false;
        self.blocking(|conn| conn.rollback()).await
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn db_info(&self) -> DbInfo {
        let mut extras = std::collections::BTreeMap::new();
        extras.insert("connect_string".to_string(), self.connect_string());
        extras.insert(
            "offset_fetch".to_string(),
            self.dialect.supports_offset_fetch().to_string(),
        );
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

        let twice = [QueryParam::from(table), QueryParam::from(table)];
        info.indexes = self
            .fetch(queries::INDEXES, &twice)
            .await?
            .iter()
            .filter_map(|row| {
                let index_name = json_to_string(row.get("index_name"))?;
                let columns = json_to_string(row.get("column_names")).unwrap_or_default();
                let unique = json_to_string(row.get("uniqueness")).as_deref() == Some("UNIQUE");
                Some(TableIndex::new(index_name, columns).unique(unique))
            })
            .collect();

        Ok(Some(info))
    }

    async fn dump(&mut self, path: &Path, tables: &[String]) -> DbResult<()> {
        let gzip = wants_gzip(&self.params, path);
        let plain = if gzip { strip_gz(path) } else { path.to_path_buf() };

        let mut tool = ToolCommand::new(tool_binary(&self.params, ATTR_DUMP_BIN, "exp"))
            .arg(self.userid())
            .arg(format!("file={}", plain.display()))
            .arg("statistics=none");
        if tables.is_empty() {
            tool = tool.arg(format!("owner={}", self.params.username()));
        } else {
            tool = tool.arg(format!("tables=({})", tables.join(",")));
        }
        run_tool(&tool).await?;

        if gzip {
            compress_file(&plain, path).await?;
        }
        info!(path = %path.display(), tables = tables.len(), "Oracle export complete");
        Ok(())
    }

    async fn restore(&mut self, path: &Path) -> DbResult<()> {
        let plain = if wants_gzip(&self.params, path) {
            decompress_file(path).await?
        } else {
            path.to_path_buf()
        };

        let tool = ToolCommand::new(tool_binary(&self.params, ATTR_RESTORE_BIN, "imp"))
            .arg(self.userid())
            .arg(format!("file={}", plain.display()))
            .args(["full=y", "ignore=y"]);
        let result = run_tool(&tool).await;

        if plain != path {
            let _ = tokio::fs::remove_file(&plain).await;
        }
        result?;
        info!(path = %path.display(), "Oracle import complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_string_prefers_service_attribute() {
        let params = ConnectionParameters::new("oci8", "ora.local", "agp", "pw", "ORCL");
        assert_eq!(
            OracleDriver::new(params.clone()).connect_string(),
            "//ora.local:1521/ORCL"
        );
        let params = params.with_attribute(ATTR_SERVICE, "XEPDB1");
        assert_eq!(
            OracleDriver::new(params).connect_string(),
            "//ora.local:1521/XEPDB1"
        );
    }

    #[test]
    fn test_to_sql_values_keeps_arity() {
        let params = vec![
            QueryParam::Null,
            QueryParam::Bool(true),
            QueryParam::from("x"),
        ];
        assert_eq!(to_sql_values(&params).len(), 3);
    }
}
