//! PostgreSQL dialect.

use super::{
    Dialect, PlaceholderStyle, UpsertStatement, is_key, parse_version, quote_with, value_tuple,
};
use crate::models::{DataType, DriverKind, TableColumn};

#[derive(Debug, Clone)]
pub struct PostgresDialect {
    /// `INSERT ... ON CONFLICT` (9.5+)
    on_conflict: bool,
}

impl Default for PostgresDialect {
    fn default() -> Self {
        Self { on_conflict: true }
    }
}

impl PostgresDialect {
    pub fn supports_on_conflict(&self) -> bool {
        self.on_conflict
    }
}

impl Dialect for PostgresDialect {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        Box::new(sqlparser::dialect::PostgreSqlDialect {})
    }

    fn set_server_version(&mut self, version: &str) {
        let (major, minor, _) = parse_version(version);
        self.on_conflict = (major, minor) >= (9, 5);
    }

    fn version_sql(&self) -> &'static str {
        "SHOW server_version"
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT tablename::text AS table_name FROM pg_catalog.pg_tables \
         WHERE schemaname = current_schema() AND tablename LIKE ? \
         ORDER BY tablename"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '"', '"')
    }

    fn data_type_sql(&self, data_type: DataType) -> String {
        match data_type {
            DataType::Int => "INT".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Float => "NUMERIC".to_string(),
            DataType::Text | DataType::LongText => "TEXT".to_string(),
            other => format!("VARCHAR({})", other.char_length().unwrap_or(254)),
        }
    }

    fn upsert_sql(
        &self,
        table: &str,
        columns: &[&str],
        primary_columns: &[&str],
    ) -> Option<UpsertStatement> {
        if !self.on_conflict {
            return None;
        }

        let assignments = columns
            .iter()
            .filter(|c| !is_key(c, primary_columns))
            .map(|c| {
                let quoted = self.enclose_column_name(c);
                format!("{quoted} = EXCLUDED.{quoted}")
            })
            .collect::<Vec<_>>();
        let action = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {action}",
            self.enclose_table_name(table),
            self.column_list(columns),
            value_tuple(columns.len()),
            self.column_list(primary_columns)
        );
        Some(UpsertStatement {
            sql,
            params: (0..columns.len()).collect(),
        })
    }

    fn change_column_sql(
        &self,
        table: &str,
        old_column: &str,
        column: &TableColumn,
    ) -> Option<Vec<String>> {
        let table = self.enclose_table_name(table);
        let new_name = self.enclose_column_name(&column.name);
        let type_sql = self.column_type_sql(column);

        let mut statements = Vec::new();
        if old_column != column.name {
            statements.push(format!(
                "ALTER TABLE {table} RENAME COLUMN {} TO {new_name}",
                self.enclose_column_name(old_column)
            ));
        }
        statements.push(format!(
            "ALTER TABLE {table} ALTER COLUMN {new_name} TYPE {type_sql} USING {new_name}::{type_sql}"
        ));
        statements.push(format!(
            "ALTER TABLE {table} ALTER COLUMN {new_name} {}",
            if column.nullable {
                "DROP NOT NULL"
            } else {
                "SET NOT NULL"
            }
        ));
        Some(statements)
    }
}
