//! SQL Server driver (tiberius over a tokio TCP stream).

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{info, warn};

use super::dump::{
    ToolCommand, compress_file, decompress_file, run_tool, strip_gz, tool_binary, wants_gzip,
};
use super::{Driver, PreparedSql, StatementCache, json_to_bool, json_to_string, query_failure};
use crate::config::{ATTR_DUMP_BIN, ATTR_RESTORE_BIN, ATTR_TRUST_CERT, ConnectionParameters};
use crate::db::types::{DATETIME_FORMAT, decimal_to_json, decode_binary_value, float_to_json};
use crate::dialect::{Dialect, SqlServerDialect};
use crate::error::{DbError, DbResult};
use crate::models::{DriverKind, QueryParam, Row, Table, TableColumn, TableIndex, TableKey};

type SqlServerClient = Client<Compat<TcpStream>>;

mod queries {
    pub const COLUMNS: &str = r#"
        SELECT
            COLUMN_NAME AS column_name,
            CASE
                WHEN CHARACTER_MAXIMUM_LENGTH = -1 THEN DATA_TYPE + '(max)'
                WHEN CHARACTER_MAXIMUM_LENGTH IS NOT NULL
                    THEN DATA_TYPE + '(' + CAST(CHARACTER_MAXIMUM_LENGTH AS NVARCHAR(10)) + ')'
                ELSE DATA_TYPE
            END AS column_type,
            IS_NULLABLE AS is_nullable
        FROM INFORMATION_SCHEMA.COLUMNS
        WHERE TABLE_SCHEMA = SCHEMA_NAME() AND TABLE_NAME = ?
        ORDER BY ORDINAL_POSITION
        "#;

    pub const PRIMARY_KEY: &str = r#"
        SELECT k.COLUMN_NAME AS column_name
        FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS t
        JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
            ON k.CONSTRAINT_NAME = t.CONSTRAINT_NAME AND k.TABLE_SCHEMA = t.TABLE_SCHEMA
        WHERE t.TABLE_SCHEMA = SCHEMA_NAME()
        AND t.TABLE_NAME = ?
        AND t.CONSTRAINT_TYPE = 'PRIMARY KEY'
        ORDER BY k.ORDINAL_POSITION
        "#;

    /// One row per index column; grouped client-side.
    pub const INDEX_COLUMNS: &str = r#"
        SELECT i.name AS index_name, c.name AS column_name, i.is_unique AS is_unique
        FROM sys.indexes i
        JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id
        JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
        WHERE i.object_id = OBJECT_ID(?)
        AND i.is_primary_key = 0
        AND i.type > 0
        ORDER BY i.name, ic.key_ordinal
        "#;
}

pub struct SqlServerDriver {
    params: ConnectionParameters,
    dialect: SqlServerDialect,
    client: Option<SqlServerClient>,
    statements: StatementCache,
    version: Option<String>,
    in_transaction: bool,
}

impl std::fmt::Debug for SqlServerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerDriver")
            .field("url", &self.params.masked_url())
            .field("connected", &self.client.is_some())
            .field("version", &self.version)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl SqlServerDriver {
    pub fn new(params: ConnectionParameters) -> Self {
        Self {
            params,
            dialect: SqlServerDialect,
            client: None,
            statements: StatementCache::default(),
            version: None,
            in_transaction: false,
        }
    }

    fn client(&mut self) -> DbResult<&mut SqlServerClient> {
        self.client.as_mut().ok_or_else(|| {
            DbError::connection("SQL Server connection is not open", "Connect first")
        })
    }

    fn prepare(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<PreparedSql> {
        let prepared = self.statements.prepare(sql, &self.dialect);
        // sp_executesql plans are cached server-side; nothing to release here
        self.statements.take_pending_flush();
        prepared
            .check_params(params)
            .map_err(|e| query_failure(e, sql, params, &self.dialect))?;
        Ok(prepared)
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.host(self.params.host());
        if let Some(port) = self.params.effective_port() {
            config.port(port);
        }
        config.database(self.params.database());
        config.application_name("agp-dal");
        config.authentication(AuthMethod::sql_server(
            self.params.username(),
            self.params.password(),
        ));
        if self.params.bool_attribute(ATTR_TRUST_CERT, false) {
            config.trust_cert();
        }
        config
    }

    /// `sqlcmd` against `master`, running one T-SQL batch.
    fn sqlcmd(&self, attribute: &str, batch: String) -> ToolCommand {
        let server = match self.params.effective_port() {
            Some(port) => format!("{},{port}", self.params.host()),
            None => self.params.host().to_string(),
        };
        ToolCommand::new(tool_binary(&self.params, attribute, "sqlcmd"))
            .args(["-S", server.as_str(), "-U", self.params.username()])
            .args(["-d", "master", "-b", "-Q"])
            .arg(batch)
            .env("SQLCMDPASSWORD", self.params.password())
    }
}

fn tiberius_error(err: tiberius::error::Error) -> DbError {
    match err {
        tiberius::error::Error::Server(token) => {
            DbError::query(token.message().to_string(), Some(token.code().to_string()))
        }
        tiberius::error::Error::Io { kind, message } => DbError::connection(
            format!("I/O error ({kind:?}): {message}"),
            "Check network connectivity and database server status",
        ),
        other => DbError::query(other.to_string(), None),
    }
}

fn to_sql_values(params: &[QueryParam]) -> Vec<Box<dyn ToSql>> {
    params
        .iter()
        .map(|param| -> Box<dyn ToSql> {
            match param {
                QueryParam::Null => Box::new(None::<String>),
                QueryParam::Bool(v) => Box::new(*v),
                QueryParam::Int(v) => Box::new(*v),
                QueryParam::Float(v) => Box::new(*v),
                QueryParam::String(v) => Box::new(v.clone()),
                QueryParam::Bytes(v) => Box::new(v.clone()),
            }
        })
        .collect()
}

fn format_temporal<T, F>(data: &ColumnData<'static>, format: F) -> JsonValue
where
    T: for<'a> FromSql<'a>,
    F: FnOnce(T) -> String,
{
    match T::from_sql(data) {
        Ok(Some(v)) => JsonValue::String(format(v)),
        _ => JsonValue::Null,
    }
}

fn decode_value(data: ColumnData<'static>) -> JsonValue {
    match data {
        ColumnData::U8(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I16(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I32(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I64(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::F32(v) => v.map_or(JsonValue::Null, |f| float_to_json(f64::from(f))),
        ColumnData::F64(v) => v.map_or(JsonValue::Null, float_to_json),
        ColumnData::Bit(v) => v.map_or(JsonValue::Null, JsonValue::Bool),
        ColumnData::String(v) => v.map_or(JsonValue::Null, |s| JsonValue::String(s.into_owned())),
        ColumnData::Guid(v) => v.map_or(JsonValue::Null, |g| JsonValue::String(g.to_string())),
        ColumnData::Binary(v) => v.map_or(JsonValue::Null, |b| decode_binary_value(&b)),
        ColumnData::Numeric(v) => v.map_or(JsonValue::Null, |n| decimal_to_json(n.to_string())),
        ColumnData::Xml(v) => v.map_or(JsonValue::Null, |x| {
            JsonValue::String(x.into_owned().into_string())
        }),
        data @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => format_temporal(&data, |v: chrono::NaiveDateTime| {
            v.format(DATETIME_FORMAT).to_string()
        }),
        data @ ColumnData::Date(_) => {
            format_temporal(&data, |v: chrono::NaiveDate| v.format("%Y-%m-%d").to_string())
        }
        data @ ColumnData::Time(_) => {
            format_temporal(&data, |v: chrono::NaiveTime| v.format("%H:%M:%S").to_string())
        }
        data @ ColumnData::DateTimeOffset(_) => {
            format_temporal(&data, |v: chrono::DateTime<chrono::FixedOffset>| {
                v.format("%Y-%m-%d %H:%M:%S%:z").to_string()
            })
        }
        #[allow(unreachable_patterns)]
        _ => JsonValue::Null,
    }
}

fn to_row(row: tiberius::Row) -> Row {
    let names: Vec<String> = row
        .columns()
        .iter()
        .map(|c| c.name().to_lowercase())
        .collect();
    names
        .into_iter()
        .zip(row)
        .map(|(name, data)| (name, decode_value(data)))
        .collect()
}

/// Fold `(index, column, unique)` rows into one [`TableIndex`] per index.
fn group_index_columns(rows: &[Row]) -> Vec<TableIndex> {
    let mut grouped: Vec<(String, Vec<String>, bool)> = Vec::new();
    for row in rows {
        let (Some(index), Some(column)) = (
            json_to_string(row.get("index_name")),
            json_to_string(row.get("column_name")),
        ) else {
            continue;
        };
        match grouped.last_mut() {
            Some((name, columns, _)) if *name == index => columns.push(column),
            _ => grouped.push((index, vec![column], json_to_bool(row.get("is_unique")))),
        }
    }
    grouped
        .into_iter()
        .map(|(name, columns, unique)| TableIndex::on_columns(name, &columns).unique(unique))
        .collect()
}

#[async_trait]
impl Driver for SqlServerDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::SqlServer
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn server_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    async fn connect(&mut self) -> DbResult<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let config = self.config();
        let connect_error = |e: String| {
            DbError::connection(
                format!("Failed to connect to {}: {e}", self.params.masked_url()),
                "Check host, port and credentials; set trust_cert for self-signed servers",
            )
        };
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| connect_error(e.to_string()))?;
        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        self.client = Some(client);
        self.in_transaction = false;

        let version_sql = self.dialect.version_sql();
        let rows = self.fetch(version_sql, &[]).await?;
        let version = rows
            .first()
            .and_then(|row| json_to_string(row.values().next()))
            .unwrap_or_default();
        self.dialect.set_server_version(&version);
        info!(url = %self.params.masked_url(), version = %version, "Connected to SQL Server");
        self.version = Some(version);
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        self.statements.clear();
        self.in_transaction = false;
        if let Some(client) = self.client.take() {
            client.close().await.map_err(tiberius_error)?;
            info!(url = %self.params.masked_url(), "SQL Server connection closed");
        }
        Ok(())
    }

    async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let prepared = self.prepare(sql, params)?;
        let client = self.client()?;
        let result = if params.is_empty() {
            match client.simple_query(prepared.sql.as_str()).await {
                Ok(stream) => stream.into_first_result().await,
                Err(e) => Err(e),
            }
        } else {
            let values = to_sql_values(params);
            let refs: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();
            match client.query(prepared.sql.as_str(), &refs).await {
                Ok(stream) => stream.into_first_result().await,
                Err(e) => Err(e),
            }
        };
        result
            .map(|rows| rows.into_iter().map(to_row).collect())
            .map_err(|e| query_failure(tiberius_error(e), sql, params, &self.dialect))
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let prepared = self.prepare(sql, params)?;
        let client = self.client()?;
        let values = to_sql_values(params);
        let refs: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();
        let result = client.execute(prepared.sql.as_str(), &refs).await;
        result
            .map(|r| r.total())
            .map_err(|e| query_failure(tiberius_error(e), sql, params, &self.dialect))
    }

    async fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        let client = self.client()?;
        let result = match client.simple_query(sql).await {
            Ok(stream) => stream.into_results().await.map(|_| ()),
            Err(e) => Err(e),
        };
        result.map_err(|e| query_failure(tiberius_error(e), sql, &[], &self.dialect))
    }

    async fn flush_prepared_statements(&mut self) -> DbResult<()> {
        self.statements.clear();
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

        let index_rows = self.fetch(queries::INDEX_COLUMNS, &name).await?;
        info.indexes = group_index_columns(&index_rows);

        Ok(Some(info))
    }

    /// Full database backup; the file is written by the server.
    async fn dump(&mut self, path: &Path, tables: &[String]) -> DbResult<()> {
        if !tables.is_empty() {
            warn!(
                tables = tables.len(),
                "SQL Server backups cover the whole database; table list ignored"
            );
        }
        let gzip = wants_gzip(&self.params, path);
        let plain = if gzip { strip_gz(path) } else { path.to_path_buf() };

        let batch = format!(
            "BACKUP DATABASE {} TO DISK = N'{}' WITH INIT",
            self.dialect.quote_identifier(self.params.database()),
            plain.display().to_string().replace('\'', "''")
        );
        run_tool(&self.sqlcmd(ATTR_DUMP_BIN, batch)).await?;

        if gzip {
            compress_file(&plain, path).await?;
        }
        info!(path = %path.display(), "SQL Server backup complete");
        Ok(())
    }

    async fn restore(&mut self, path: &Path) -> DbResult<()> {
        // RESTORE needs exclusive access to the database
        self.close().await?;

        let plain = if wants_gzip(&self.params, path) {
            decompress_file(path).await?
        } else {
            path.to_path_buf()
        };
        let batch = format!(
            "RESTORE DATABASE {} FROM DISK = N'{}' WITH REPLACE",
            self.dialect.quote_identifier(self.params.database()),
            plain.display().to_string().replace('\'', "''")
        );
        let result = run_tool(&self.sqlcmd(ATTR_RESTORE_BIN, batch)).await;

        if plain != path {
            let _ = tokio::fs::remove_file(&plain).await;
        }
        result?;
        info!(path = %path.display(), "SQL Server restore complete");
        Ok(())
    }
}
