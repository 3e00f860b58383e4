//! MySQL / MariaDB dialect.

use super::{Dialect, PlaceholderStyle, UpsertStatement, is_key, quote_with, value_tuple};
use crate::models::{DataType, DriverKind, TableColumn};

#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn kind(&self) -> DriverKind {
        DriverKind::MySql
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn backslash_escapes(&self) -> bool {
        // Off only under NO_BACKSLASH_ESCAPES
        true
    }

    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        Box::new(sqlparser::dialect::MySqlDialect {})
    }

    fn version_sql(&self) -> &'static str {
        "SELECT VERSION()"
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT CONVERT(TABLE_NAME USING utf8mb4) AS table_name \
         FROM information_schema.TABLES \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' AND TABLE_NAME LIKE ? \
         ORDER BY TABLE_NAME"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '`', '`')
    }

    fn data_type_sql(&self, data_type: DataType) -> String {
        match data_type {
            DataType::Int => "INT".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Float => "DOUBLE".to_string(),
            DataType::Text => "TEXT".to_string(),
            DataType::LongText => "LONGTEXT".to_string(),
            other => format!("VARCHAR({})", other.char_length().unwrap_or(254)),
        }
    }

    fn concat_expression(&self, parts: &[&str]) -> String {
        format!("CONCAT({})", parts.join(", "))
    }

    fn substring_expression(&self, expr: &str, offset: u64, length: Option<u64>) -> String {
        match length {
            Some(length) => format!("SUBSTRING({expr}, {offset}, {length})"),
            None => format!("SUBSTRING({expr}, {offset})"),
        }
    }

    fn string_length_expression(&self, expr: &str) -> String {
        format!("CHAR_LENGTH({expr})")
    }

    fn begin_sql(&self) -> &'static str {
        "START TRANSACTION"
    }

    /// `ON DUPLICATE KEY UPDATE` with the non-key values bound a second time.
    fn upsert_sql(
        &self,
        table: &str,
        columns: &[&str],
        primary_columns: &[&str],
    ) -> Option<UpsertStatement> {
        let mut params: Vec<usize> = (0..columns.len()).collect();
        let mut assignments = Vec::new();
        for (i, column) in columns.iter().enumerate() {
            if !is_key(column, primary_columns) {
                assignments.push(format!("{} = ?", self.enclose_column_name(column)));
                params.push(i);
            }
        }

        let insert = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.enclose_table_name(table),
            self.column_list(columns),
            value_tuple(columns.len())
        );
        let sql = if assignments.is_empty() {
            insert.replacen("INSERT INTO", "INSERT IGNORE INTO", 1)
        } else {
            format!("{insert} ON DUPLICATE KEY UPDATE {}", assignments.join(", "))
        };
        Some(UpsertStatement { sql, params })
    }

    fn create_table_suffix(&self) -> &'static str {
        " ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
    }

    fn rename_table_sql(&self, old_name: &str, new_name: &str) -> String {
        format!(
            "RENAME TABLE {} TO {}",
            self.enclose_table_name(old_name),
            self.enclose_table_name(new_name)
        )
    }

    fn change_column_sql(
        &self,
        table: &str,
        old_column: &str,
        column: &TableColumn,
    ) -> Option<Vec<String>> {
        Some(vec![format!(
            "ALTER TABLE {} CHANGE COLUMN {} {}",
            self.enclose_table_name(table),
            self.enclose_column_name(old_column),
            self.column_definition(column)
        )])
    }

    fn drop_index_sql(&self, table: &str, index: &str) -> String {
        format!(
            "DROP INDEX {} ON {}",
            self.quote_identifier(index),
            self.enclose_table_name(table)
        )
    }
}
