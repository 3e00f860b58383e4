//! Shared helpers for the SQLite-backed integration tests.

#![allow(dead_code)]

use agp_dal::config::ConnectionParameters;
use agp_dal::models::{DataType, QueryParam, Row, Table, TableColumn};
use agp_dal::Connection;
use tempfile::TempDir;

/// A connection to a fresh SQLite file inside `dir`.
pub fn sqlite(dir: &TempDir) -> Connection {
    Connection::new(ConnectionParameters::sqlite(dir.path(), "agp_test")).unwrap()
}

/// `id INT` primary key plus the given columns.
pub fn keyed_table(name: &str, columns: &[(&str, DataType)]) -> Table {
    let mut table = Table::new(name)
        .with_column(TableColumn::new("id", DataType::Int).not_null())
        .with_key("id");
    for (column, data_type) in columns {
        table = table.with_column(TableColumn::new(*column, *data_type));
    }
    table
}

pub fn int(row: &Row, column: &str) -> i64 {
    row.get(column)
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| panic!("{column} is not an integer in {row:?}"))
}

pub fn text(row: &Row, column: &str) -> String {
    row.get(column)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("{column} is not a string in {row:?}"))
        .to_string()
}

pub async fn count(conn: &mut Connection, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) AS cnt FROM {}", conn.enclose_table_name(table));
    let row = conn
        .fetch_row(sql.as_str().into())
        .await
        .unwrap()
        .unwrap();
    int(&row, "cnt")
}

pub fn id(value: i64) -> QueryParam {
    QueryParam::Int(value)
}
