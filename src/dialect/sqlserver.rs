//! SQL Server dialect.

use super::{
    Dialect, PlaceholderStyle, UpsertStatement, has_outer_order_by, is_key, quote_with,
    value_tuple,
};
use crate::models::{DataType, DriverKind, TableColumn};

#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

/// `'...'` literal for procedure arguments.
fn string_literal(s: &str) -> String {
    format!("N'{}'", s.replace('\'', "''"))
}

impl Dialect for SqlServerDialect {
    fn kind(&self) -> DriverKind {
        DriverKind::SqlServer
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::AtP
    }

    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        Box::new(sqlparser::dialect::MsSqlDialect {})
    }

    fn version_sql(&self) -> &'static str {
        "SELECT CAST(SERVERPROPERTY('ProductVersion') AS NVARCHAR(128)) AS version"
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT TABLE_NAME AS table_name FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_NAME LIKE ? ORDER BY TABLE_NAME"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '[', ']')
    }

    fn data_type_sql(&self, data_type: DataType) -> String {
        match data_type {
            DataType::Int => "INT".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Float => "FLOAT(24)".to_string(),
            DataType::Text | DataType::LongText => "NVARCHAR(MAX)".to_string(),
            other => format!("NVARCHAR({})", other.char_length().unwrap_or(254)),
        }
    }

    /// `OFFSET ... FETCH` requires an `ORDER BY`; one is synthesized on the
    /// outer query when missing.
    fn append_limit_expression(&self, query: &str, start: u64, end: u64) -> String {
        let count = end.saturating_sub(start) + 1;
        let ordered = if has_outer_order_by(query) {
            query.to_string()
        } else {
            format!("{query} ORDER BY 1 ASC")
        };
        format!("{ordered} OFFSET {start} ROWS FETCH NEXT {count} ROWS ONLY")
    }

    fn concat_expression(&self, parts: &[&str]) -> String {
        match parts {
            [single] => single.to_string(),
            _ => format!("CONCAT({})", parts.join(", ")),
        }
    }

    fn least_expression(&self, parts: &[&str]) -> String {
        let rows = parts
            .iter()
            .map(|p| format!("({p})"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("(SELECT MIN(v) FROM (VALUES {rows}) AS least_values(v))")
    }

    fn substring_expression(&self, expr: &str, offset: u64, length: Option<u64>) -> String {
        match length {
            Some(length) => format!("SUBSTRING({expr}, {offset}, {length})"),
            None => format!("SUBSTRING({expr}, {offset}, LEN({expr}))"),
        }
    }

    fn string_length_expression(&self, expr: &str) -> String {
        format!("LEN({expr})")
    }

    fn begin_sql(&self) -> &'static str {
        "BEGIN TRANSACTION"
    }

    fn commit_sql(&self) -> &'static str {
        "COMMIT TRANSACTION"
    }

    fn rollback_sql(&self) -> &'static str {
        "ROLLBACK TRANSACTION"
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVE TRANSACTION {name}")
    }

    /// Savepoints end with the enclosing transaction.
    fn release_savepoint_sql(&self, _name: &str) -> Option<String> {
        None
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TRANSACTION {name}")
    }

    fn upsert_sql(
        &self,
        table: &str,
        columns: &[&str],
        primary_columns: &[&str],
    ) -> Option<UpsertStatement> {
        let on = primary_columns
            .iter()
            .map(|k| {
                let k = self.enclose_column_name(k);
                format!("tgt.{k} = src.{k}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let updates = columns
            .iter()
            .filter(|c| !is_key(c, primary_columns))
            .map(|c| {
                let c = self.enclose_column_name(c);
                format!("tgt.{c} = src.{c}")
            })
            .collect::<Vec<_>>();
        let insert_values = columns
            .iter()
            .map(|c| format!("src.{}", self.enclose_column_name(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let column_list = self.column_list(columns);

        let mut sql = format!(
            "MERGE INTO {} AS tgt USING (VALUES {}) AS src ({column_list}) ON ({on})",
            self.enclose_table_name(table),
            value_tuple(columns.len())
        );
        if !updates.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", updates.join(", ")));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({column_list}) VALUES ({insert_values});"
        ));

        Some(UpsertStatement {
            sql,
            params: (0..columns.len()).collect(),
        })
    }

    fn rename_table_sql(&self, old_name: &str, new_name: &str) -> String {
        format!(
            "EXEC sp_rename {}, {}",
            string_literal(old_name),
            string_literal(new_name)
        )
    }

    fn add_column_sql(&self, table: &str, column: &TableColumn) -> String {
        format!(
            "ALTER TABLE {} ADD {}",
            self.enclose_table_name(table),
            self.column_definition(column)
        )
    }

    fn change_column_sql(
        &self,
        table: &str,
        old_column: &str,
        column: &TableColumn,
    ) -> Option<Vec<String>> {
        let mut statements = Vec::new();
        if old_column != column.name {
            statements.push(format!(
                "EXEC sp_rename {}, {}, 'COLUMN'",
                string_literal(&format!("{table}.{old_column}")),
                string_literal(&column.name)
            ));
        }
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {}",
            self.enclose_table_name(table),
            self.column_definition(column)
        ));
        Some(statements)
    }

    fn drop_index_sql(&self, table: &str, index: &str) -> String {
        format!(
            "DROP INDEX {} ON {}",
            self.quote_identifier(index),
            self.enclose_table_name(table)
        )
    }
}
