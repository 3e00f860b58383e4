//! SQLite dialect.
//!
//! SQLite cannot alter or drop columns in place here; the driver rebuilds
//! the table through a shadow copy using the helpers on [`SqliteDialect`].

use super::{
    Dialect, MAX_PARAMS_PER_STATEMENT, PlaceholderStyle, UpsertStatement, is_key, parse_version,
    quote_with, value_tuple,
};
use crate::models::{DataType, DriverKind, TableColumn};

pub const SHADOW_SUFFIX: &str = "_shadow";

/// `SQLITE_MAX_COMPOUND_SELECT` default; bounds the `UNION ALL` insert form.
pub const MAX_COMPOUND_SELECT: usize = 500;

#[derive(Debug, Clone)]
pub struct SqliteDialect {
    /// Multi-row `VALUES (...), (...)` (3.7.11+)
    multi_values: bool,
}

impl Default for SqliteDialect {
    fn default() -> Self {
        Self { multi_values: true }
    }
}

impl SqliteDialect {
    pub fn supports_multi_values(&self) -> bool {
        self.multi_values
    }

    pub fn shadow_table_name(&self, table: &str) -> String {
        format!("{table}{SHADOW_SUFFIX}")
    }

    /// Copy rows between tables; `columns` pairs target with source column.
    pub fn copy_rows_sql(&self, source: &str, target: &str, columns: &[(&str, &str)]) -> String {
        let targets = columns
            .iter()
            .map(|(t, _)| self.enclose_column_name(t))
            .collect::<Vec<_>>()
            .join(", ");
        let sources = columns
            .iter()
            .map(|(_, s)| self.enclose_column_name(s))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({targets}) SELECT {sources} FROM {}",
            self.enclose_table_name(target),
            self.enclose_table_name(source)
        )
    }
}

impl Dialect for SqliteDialect {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::NumberedQuestion
    }

    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        Box::new(sqlparser::dialect::SQLiteDialect {})
    }

    fn set_server_version(&mut self, version: &str) {
        self.multi_values = parse_version(version) >= (3, 7, 11);
    }

    fn version_sql(&self) -> &'static str {
        "SELECT sqlite_version()"
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT name AS table_name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name LIKE ? \
         ORDER BY name"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '"', '"')
    }

    fn data_type_sql(&self, data_type: DataType) -> String {
        match data_type {
            DataType::Int => "INTEGER".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Float => "REAL".to_string(),
            DataType::Text => "TEXT".to_string(),
            DataType::LongText => "LONGTEXT".to_string(),
            other => format!("VARCHAR({})", other.char_length().unwrap_or(254)),
        }
    }

    fn least_expression(&self, parts: &[&str]) -> String {
        format!("MIN({})", parts.join(", "))
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn max_rows_per_statement(&self, columns: usize) -> usize {
        let by_params = (MAX_PARAMS_PER_STATEMENT / columns.max(1)).max(1);
        if self.multi_values {
            by_params
        } else {
            by_params.min(MAX_COMPOUND_SELECT)
        }
    }

    fn multi_insert_sql(&self, table: &str, columns: &[&str], rows: usize) -> String {
        let head = format!(
            "INSERT INTO {} ({})",
            self.enclose_table_name(table),
            self.column_list(columns)
        );
        if self.multi_values || rows <= 1 {
            let tuples = vec![value_tuple(columns.len()); rows.max(1)].join(", ");
            return format!("{head} VALUES {tuples}");
        }
        let select = format!("SELECT {}", vec!["?"; columns.len()].join(", "));
        format!("{head} {}", vec![select; rows].join(" UNION ALL "))
    }

    fn upsert_sql(
        &self,
        table: &str,
        columns: &[&str],
        primary_columns: &[&str],
    ) -> Option<UpsertStatement> {
        let verb = if columns.iter().all(|c| is_key(c, primary_columns)) {
            "INSERT OR IGNORE"
        } else {
            "INSERT OR REPLACE"
        };
        Some(UpsertStatement {
            sql: format!(
                "{verb} INTO {} ({}) VALUES {}",
                self.enclose_table_name(table),
                self.column_list(columns),
                value_tuple(columns.len())
            ),
            params: (0..columns.len()).collect(),
        })
    }

    fn change_column_sql(
        &self,
        _table: &str,
        _old_column: &str,
        _column: &TableColumn,
    ) -> Option<Vec<String>> {
        None
    }

    fn remove_column_sql(&self, _table: &str, _column: &str) -> Option<String> {
        None
    }
}
