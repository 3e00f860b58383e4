//! Oracle dialect.
//!
//! Identifiers are emitted unquoted: a quoted Oracle identifier is
//! case-sensitive and would no longer match unquoted caller SQL.

use super::{Dialect, PlaceholderStyle, UpsertStatement, is_key, parse_version, value_tuple};
use crate::models::{DataType, DriverKind, TableColumn};

/// Column added by the `ROWNUM` paging wrapper.
pub const ROWNUM_COLUMN: &str = "rnum";

/// Maximum characters of the `VARCHAR2` mapping used for `TEXT`.
pub const VARCHAR2_LIMIT: usize = 4000;

#[derive(Debug, Clone, Default)]
pub struct OracleDialect {
    /// `OFFSET ... FETCH` (12c+)
    offset_fetch: bool,
}

impl OracleDialect {
    pub fn supports_offset_fetch(&self) -> bool {
        self.offset_fetch
    }
}

impl Dialect for OracleDialect {
    fn kind(&self) -> DriverKind {
        DriverKind::Oracle
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Named
    }

    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        Box::new(sqlparser::dialect::GenericDialect {})
    }

    fn set_server_version(&mut self, version: &str) {
        let (major, _, _) = parse_version(version);
        self.offset_fetch = major >= 12;
    }

    fn version_sql(&self) -> &'static str {
        "SELECT version FROM product_component_version WHERE product LIKE 'Oracle%'"
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT LOWER(table_name) AS table_name FROM user_tables \
         WHERE LOWER(table_name) LIKE ? ORDER BY table_name"
    }

    fn quote_identifier(&self, name: &str) -> String {
        name.to_string()
    }

    fn data_type_sql(&self, data_type: DataType) -> String {
        match data_type {
            DataType::Int => "NUMBER(10,0)".to_string(),
            DataType::BigInt => "NUMBER(19,0)".to_string(),
            DataType::Float => "FLOAT(24)".to_string(),
            DataType::Text => format!("VARCHAR2({VARCHAR2_LIMIT})"),
            DataType::LongText => "CLOB".to_string(),
            other => format!("VARCHAR2({})", other.char_length().unwrap_or(254)),
        }
    }

    fn text_length_limit(&self) -> Option<usize> {
        Some(VARCHAR2_LIMIT)
    }

    fn append_limit_expression(&self, query: &str, start: u64, end: u64) -> String {
        let count = end.saturating_sub(start) + 1;
        if self.offset_fetch {
            return format!("{query} OFFSET {start} ROWS FETCH NEXT {count} ROWS ONLY");
        }
        format!(
            "SELECT * FROM (SELECT agp_page.*, ROWNUM {ROWNUM_COLUMN} FROM ({query}) agp_page \
             WHERE ROWNUM <= {}) WHERE {ROWNUM_COLUMN} > {start}",
            end + 1
        )
    }

    fn multi_insert_sql(&self, table: &str, columns: &[&str], rows: usize) -> String {
        if rows <= 1 {
            return format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.enclose_table_name(table),
                self.column_list(columns),
                value_tuple(columns.len())
            );
        }
        let into = format!(
            "INTO {} ({}) VALUES {}",
            self.enclose_table_name(table),
            self.column_list(columns),
            value_tuple(columns.len())
        );
        format!("INSERT ALL {} SELECT * FROM DUAL", vec![into; rows].join(" "))
    }

    fn upsert_sql(
        &self,
        table: &str,
        columns: &[&str],
        primary_columns: &[&str],
    ) -> Option<UpsertStatement> {
        let table = self.enclose_table_name(table);
        let source = columns
            .iter()
            .map(|c| format!("? AS {}", self.enclose_column_name(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let on = primary_columns
            .iter()
            .map(|k| {
                let k = self.enclose_column_name(k);
                format!("{table}.{k} = src.{k}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let updates = columns
            .iter()
            .filter(|c| !is_key(c, primary_columns))
            .map(|c| {
                let c = self.enclose_column_name(c);
                format!("{table}.{c} = src.{c}")
            })
            .collect::<Vec<_>>();
        let insert_values = columns
            .iter()
            .map(|c| format!("src.{}", self.enclose_column_name(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!("MERGE INTO {table} USING (SELECT {source} FROM DUAL) src ON ({on})");
        if !updates.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", updates.join(", ")));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({insert_values})",
            self.column_list(columns)
        ));

        Some(UpsertStatement {
            sql,
            params: (0..columns.len()).collect(),
        })
    }

    fn add_column_sql(&self, table: &str, column: &TableColumn) -> String {
        format!(
            "ALTER TABLE {} ADD ({})",
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
        let table = self.enclose_table_name(table);
        let mut statements = Vec::new();
        if !old_column.eq_ignore_ascii_case(&column.name) {
            statements.push(format!(
                "ALTER TABLE {table} RENAME COLUMN {} TO {}",
                self.enclose_column_name(old_column),
                self.enclose_column_name(&column.name)
            ));
        }
        statements.push(format!(
            "ALTER TABLE {table} MODIFY ({} {})",
            self.enclose_column_name(&column.name),
            self.column_type_sql(column)
        ));
        Some(statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_and_identifiers() {
        let d = OracleDialect::default();
        assert_eq!(d.enclose_table_name("agp_user"), "agp_user");
        assert_eq!(d.data_type_sql(DataType::Int), "NUMBER(10,0)");
        assert_eq!(d.data_type_sql(DataType::Text), "VARCHAR2(4000)");
        assert_eq!(d.data_type_sql(DataType::LongText), "CLOB");
        assert_eq!(d.text_length_limit(), Some(4000));
    }

    #[test]
    fn test_rownum_paging() {
        let d = OracleDialect::default();
        assert_eq!(
            d.append_limit_expression("SELECT * FROM t ORDER BY id", 5, 14),
            "SELECT * FROM (SELECT agp_page.*, ROWNUM rnum FROM (SELECT * FROM t ORDER BY id) agp_page \
             WHERE ROWNUM <= 15) WHERE rnum > 5"
        );
    }

    #[test]
    fn test_offset_fetch_paging() {
        let mut d = OracleDialect::default();
        d.set_server_version("19.3.0.0.0");
        assert_eq!(
            d.append_limit_expression("SELECT * FROM t ORDER BY id", 0, 9),
            "SELECT * FROM t ORDER BY id OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        d.set_server_version("11.2.0.4.0");
        assert!(!d.supports_offset_fetch());
    }

    #[test]
    fn test_insert_all() {
        let d = OracleDialect::default();
        assert_eq!(
            d.multi_insert_sql("t", &["a", "b"], 2),
            "INSERT ALL INTO t (a, b) VALUES (?, ?) INTO t (a, b) VALUES (?, ?) SELECT * FROM DUAL"
        );
    }

    #[test]
    fn test_merge_upsert() {
        let d = OracleDialect::default();
        let upsert = d.upsert_sql("t", &["id", "v"], &["id"]).unwrap();
        assert_eq!(
            upsert.sql,
            "MERGE INTO t USING (SELECT ? AS id, ? AS v FROM DUAL) src ON (t.id = src.id) \
             WHEN MATCHED THEN UPDATE SET t.v = src.v \
             WHEN NOT MATCHED THEN INSERT (id, v) VALUES (src.id, src.v)"
        );
        assert_eq!(upsert.params, vec![0, 1]);
    }

    #[test]
    fn test_change_column() {
        let d = OracleDialect::default();
        assert_eq!(
            d.change_column_sql("t", "old_int", &TableColumn::new("new_bigint", DataType::BigInt))
                .unwrap(),
            vec![
                "ALTER TABLE t RENAME COLUMN old_int TO new_bigint",
                "ALTER TABLE t MODIFY (new_bigint NUMBER(19,0))",
            ]
        );
        assert_eq!(
            d.add_column_sql("t", &TableColumn::new("c", DataType::Char20)),
            "ALTER TABLE t ADD (c VARCHAR2(20) NULL)"
        );
    }
}
