//! SQL dialects.
//!
//! A [`Dialect`] turns vendor-neutral requests into one engine's SQL. It does
//! no I/O; drivers own a dialect and execute what it produces. Default method
//! bodies cover the ANSI-ish common case and each engine overrides only where
//! its syntax diverges.

pub mod mysql;
pub mod oracle;
pub mod placeholder;
pub mod postgres;
pub mod sqlite;
pub mod sqlserver;

use sqlparser::ast::Statement;
use sqlparser::parser::Parser;

use crate::models::{DataType, DriverKind, QueryParam, Table, TableColumn, TableIndex};

pub use mysql::MySqlDialect;
pub use oracle::OracleDialect;
pub use placeholder::{
    PlaceholderStyle, RewrittenQuery, count_placeholders, rewrite_placeholders, substitute_params,
};
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;
pub use sqlserver::SqlServerDialect;

/// Upper bound on bound parameters in one generated statement.
pub const MAX_PARAMS_PER_STATEMENT: usize = 970;

/// A native upsert statement.
///
/// `params` lists, in placeholder order, the index into the caller's value
/// list that binds to each `?`. Values may repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertStatement {
    pub sql: String,
    pub params: Vec<usize>,
}

impl UpsertStatement {
    /// Expand the caller's values into the bind order.
    pub fn bind_values(&self, values: &[QueryParam]) -> Vec<QueryParam> {
        self.params
            .iter()
            .filter_map(|&i| values.get(i).cloned())
            .collect()
    }
}

/// Engine-specific SQL generation.
pub trait Dialect: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> DriverKind;

    fn placeholder_style(&self) -> PlaceholderStyle;

    /// Whether `\` escapes the next character inside quoted strings.
    fn backslash_escapes(&self) -> bool {
        false
    }

    /// sqlparser dialect used for statement classification and rendering.
    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect>;

    /// Adjust version-sensitive behaviour once the server version is known.
    fn set_server_version(&mut self, _version: &str) {}

    /// Query returning the server version as a single string column.
    fn version_sql(&self) -> &'static str;

    /// Query listing base tables; binds one `LIKE` pattern.
    fn list_tables_sql(&self) -> &'static str;

    fn quote_identifier(&self, name: &str) -> String;

    fn enclose_column_name(&self, name: &str) -> String {
        self.quote_identifier(name)
    }

    fn enclose_table_name(&self, name: &str) -> String {
        self.quote_identifier(name)
    }

    fn data_type_sql(&self, data_type: DataType) -> String;

    /// Character ceiling of the `TEXT` mapping, if the engine has one.
    fn text_length_limit(&self) -> Option<usize> {
        None
    }

    /// Rendered type of a column: the neutral type when known, else the
    /// introspected vendor type.
    fn column_type_sql(&self, column: &TableColumn) -> String {
        match column.data_type {
            Some(data_type) => self.data_type_sql(data_type),
            None => column.type_sql.clone(),
        }
    }

    fn column_definition(&self, column: &TableColumn) -> String {
        format!(
            "{} {} {}",
            self.enclose_column_name(&column.name),
            self.column_type_sql(column),
            if column.nullable { "NULL" } else { "NOT NULL" }
        )
    }

    /// Restrict `query` to rows `[start, end]` (0-based, inclusive).
    fn append_limit_expression(&self, query: &str, start: u64, end: u64) -> String {
        let count = end.saturating_sub(start) + 1;
        format!("{query} LIMIT {count} OFFSET {start}")
    }

    fn concat_expression(&self, parts: &[&str]) -> String {
        match parts {
            [single] => single.to_string(),
            _ => parts.join(" || "),
        }
    }

    fn least_expression(&self, parts: &[&str]) -> String {
        format!("LEAST({})", parts.join(", "))
    }

    /// Substring with a 1-based `offset`.
    fn substring_expression(&self, expr: &str, offset: u64, length: Option<u64>) -> String {
        match length {
            Some(length) => format!("SUBSTR({expr}, {offset}, {length})"),
            None => format!("SUBSTR({expr}, {offset})"),
        }
    }

    fn string_length_expression(&self, expr: &str) -> String {
        format!("LENGTH({expr})")
    }

    fn begin_sql(&self) -> &'static str {
        "BEGIN"
    }

    fn commit_sql(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_sql(&self) -> &'static str {
        "ROLLBACK"
    }

    /// Whether DDL statements can be rolled back with the transaction.
    fn transactional_ddl(&self) -> bool {
        false
    }

    fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVEPOINT {}", self.quote_identifier(name))
    }

    /// `None` when the engine has no release statement.
    fn release_savepoint_sql(&self, name: &str) -> Option<String> {
        Some(format!("RELEASE SAVEPOINT {}", self.quote_identifier(name)))
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.quote_identifier(name))
    }

    // DML

    fn select_sql(&self, table: &str, columns: &[&str], identifiers: &[&str]) -> String {
        let columns = if columns.is_empty() {
            "*".to_string()
        } else {
            self.column_list(columns)
        };
        format!(
            "SELECT {columns} FROM {}{}",
            self.enclose_table_name(table),
            self.where_clause(identifiers)
        )
    }

    fn count_sql(&self, table: &str, identifiers: &[&str]) -> String {
        format!(
            "SELECT COUNT(*) AS cnt FROM {}{}",
            self.enclose_table_name(table),
            self.where_clause(identifiers)
        )
    }

    fn insert_sql(&self, table: &str, columns: &[&str]) -> String {
        self.multi_insert_sql(table, columns, 1)
    }

    /// Rows of `columns` values that fit in one multi-row insert.
    fn max_rows_per_statement(&self, columns: usize) -> usize {
        (MAX_PARAMS_PER_STATEMENT / columns.max(1)).max(1)
    }

    /// One statement inserting `rows` tuples.
    fn multi_insert_sql(&self, table: &str, columns: &[&str], rows: usize) -> String {
        let tuple = value_tuple(columns.len());
        let tuples = vec![tuple; rows.max(1)].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES {tuples}",
            self.enclose_table_name(table),
            self.column_list(columns)
        )
    }

    fn update_sql(&self, table: &str, columns: &[&str], identifiers: &[&str]) -> String {
        let assignments = columns
            .iter()
            .map(|c| format!("{} = ?", self.enclose_column_name(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {} SET {assignments}{}",
            self.enclose_table_name(table),
            self.where_clause(identifiers)
        )
    }

    fn delete_sql(&self, table: &str, identifiers: &[&str]) -> String {
        format!(
            "DELETE FROM {}{}",
            self.enclose_table_name(table),
            self.where_clause(identifiers)
        )
    }

    /// Native upsert; `None` selects the select-then-branch fallback.
    fn upsert_sql(
        &self,
        _table: &str,
        _columns: &[&str],
        _primary_columns: &[&str],
    ) -> Option<UpsertStatement> {
        None
    }

    // DDL

    /// `CREATE TABLE` followed by one statement per secondary index.
    fn create_table_sql(&self, table: &Table) -> Vec<String> {
        let mut statements = vec![format!(
            "CREATE TABLE {} ({}){}",
            self.enclose_table_name(&table.name),
            self.table_body(table),
            self.create_table_suffix()
        )];
        statements.extend(
            table
                .indexes
                .iter()
                .map(|index| self.create_index_sql(&table.name, index)),
        );
        statements
    }

    /// Column definitions and primary key clause.
    fn table_body(&self, table: &Table) -> String {
        let keys = table.primary_columns();
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|column| {
                if keys.iter().any(|k| k.eq_ignore_ascii_case(&column.name)) {
                    self.column_definition(&column.clone().not_null())
                } else {
                    self.column_definition(column)
                }
            })
            .collect();
        if !keys.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", self.column_list(&keys)));
        }
        parts.join(", ")
    }

    fn create_table_suffix(&self) -> &'static str {
        ""
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.enclose_table_name(table))
    }

    fn rename_table_sql(&self, old_name: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            self.enclose_table_name(old_name),
            self.enclose_table_name(new_name)
        )
    }

    fn add_column_sql(&self, table: &str, column: &TableColumn) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.enclose_table_name(table),
            self.column_definition(column)
        )
    }

    /// Rename and/or retype a column; `None` when the engine cannot alter
    /// columns in place.
    fn change_column_sql(
        &self,
        _table: &str,
        _old_column: &str,
        _column: &TableColumn,
    ) -> Option<Vec<String>> {
        None
    }

    /// `None` when the engine cannot drop columns in place.
    fn remove_column_sql(&self, table: &str, column: &str) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.enclose_table_name(table),
            self.enclose_column_name(column)
        ))
    }

    fn create_index_sql(&self, table: &str, index: &TableIndex) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_identifier(&index.name),
            self.enclose_table_name(table),
            self.column_list(&index.columns())
        )
    }

    fn drop_index_sql(&self, _table: &str, index: &str) -> String {
        format!("DROP INDEX {}", self.quote_identifier(index))
    }

    // helpers

    fn column_list(&self, columns: &[&str]) -> String {
        columns
            .iter()
            .map(|c| {
                if *c == "*" {
                    c.to_string()
                } else {
                    self.enclose_column_name(c)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn where_clause(&self, identifiers: &[&str]) -> String {
        if identifiers.is_empty() {
            return String::new();
        }
        let predicates = identifiers
            .iter()
            .map(|c| format!("{} = ?", self.enclose_column_name(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(" WHERE {predicates}")
    }
}

/// Build the default dialect for an engine.
pub fn for_kind(kind: DriverKind) -> Box<dyn Dialect> {
    match kind {
        DriverKind::MySql => Box::new(MySqlDialect::default()),
        DriverKind::Postgres => Box::new(PostgresDialect::default()),
        DriverKind::Oracle => Box::new(OracleDialect::default()),
        DriverKind::SqlServer => Box::new(SqlServerDialect::default()),
        DriverKind::Sqlite => Box::new(SqliteDialect::default()),
    }
}

/// `(?, ?, ?)` for `n` columns.
pub fn value_tuple(n: usize) -> String {
    format!("({})", vec!["?"; n].join(", "))
}

/// Whether `column` is one of `primary_columns` (case-insensitive).
pub fn is_key(column: &str, primary_columns: &[&str]) -> bool {
    primary_columns
        .iter()
        .any(|k| k.eq_ignore_ascii_case(column))
}

/// Quote `name` with `open`/`close`, doubling any embedded `close`.
pub fn quote_with(name: &str, open: char, close: char) -> String {
    let escaped = name.replace(close, &format!("{close}{close}"));
    format!("{open}{escaped}{close}")
}

/// Parse `major.minor.patch` prefixes such as `8.0.36-0ubuntu` or
/// `PostgreSQL 9.4.26 on x86_64`.
pub fn parse_version(version: &str) -> (u32, u32, u32) {
    let start = version.find(|c: char| c.is_ascii_digit()).unwrap_or(0);
    let mut parts = version[start..]
        .split(|c: char| !c.is_ascii_digit())
        .take(3)
        .map(|p| p.parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Whether `query` has an `ORDER BY` at parenthesis depth zero, i.e. one
/// that belongs to the outer query rather than a sub-query.
pub fn has_outer_order_by(query: &str) -> bool {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut outer = String::with_capacity(query.len());

    for c in query.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ if depth == 0 => outer.push(c.to_ascii_uppercase()),
                _ => {}
            },
        }
        if quote.is_some() || depth > 0 {
            outer.push(' ');
        }
    }

    let normalized = outer.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.contains("ORDER BY")
}

/// Coarse statement classes used for cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Write,
    Ddl,
    Other,
}

/// Classify `sql` with sqlparser, falling back to the leading keyword when
/// the statement does not parse.
pub fn classify(sql: &str, dialect: &dyn Dialect) -> StatementKind {
    let parser_dialect = dialect.parser_dialect();
    let parsed = match Parser::parse_sql(parser_dialect.as_ref(), sql) {
        Ok(statements) => statements
            .iter()
            .map(classify_statement)
            .max_by_key(|k| match k {
                StatementKind::Ddl => 3,
                StatementKind::Write => 2,
                StatementKind::Other => 1,
                StatementKind::Query => 0,
            })
            .unwrap_or(StatementKind::Other),
        Err(_) => StatementKind::Other,
    };
    match parsed {
        StatementKind::Other => classify_keyword(sql),
        kind => kind,
    }
}

fn classify_statement(stmt: &Statement) -> StatementKind {
    match stmt {
        Statement::Query(_) => StatementKind::Query,
        Statement::Insert { .. }
        | Statement::Update { .. }
        | Statement::Delete { .. }
        | Statement::Merge { .. } => StatementKind::Write,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => StatementKind::Ddl,
        _ => StatementKind::Other,
    }
}

fn classify_keyword(sql: &str) -> StatementKind {
    let keyword = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match keyword.as_str() {
        "SELECT" | "WITH" | "SHOW" | "PRAGMA" => StatementKind::Query,
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" => StatementKind::Write,
        "CREATE" | "ALTER" | "DROP" | "RENAME" | "TRUNCATE" => StatementKind::Ddl,
        _ => StatementKind::Other,
    }
}

/// Render a failed query for error reports: parameters substituted,
/// formatted by sqlparser when it parses, whitespace-normalised otherwise.
pub fn render_query(sql: &str, params: &[QueryParam], dialect: &dyn Dialect) -> String {
    let substituted = substitute_params(sql, params, dialect.backslash_escapes());
    let parser_dialect = dialect.parser_dialect();
    match Parser::parse_sql(parser_dialect.as_ref(), &substituted) {
        Ok(statements) if !statements.is_empty() => statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(";\n"),
        _ => substituted.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outer_order_by_detection() {
        assert!(has_outer_order_by("SELECT * FROM t ORDER BY a"));
        assert!(has_outer_order_by("SELECT * FROM t order\n  by a"));
        assert!(has_outer_order_by(
            "SELECT * FROM (SELECT a FROM t) x ORDER BY COALESCE(a, 0)"
        ));
        assert!(!has_outer_order_by(
            "SELECT * FROM (SELECT TOP 5 a FROM t ORDER BY a) x"
        ));
        assert!(!has_outer_order_by("SELECT 'ORDER BY' FROM t"));
        assert!(!has_outer_order_by("SELECT * FROM t"));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("8.0.36-0ubuntu0.22.04.1"), (8, 0, 36));
        assert_eq!(parse_version("PostgreSQL 9.4.26 on x86_64"), (9, 4, 26));
        assert_eq!(parse_version("3.45.1"), (3, 45, 1));
        assert_eq!(parse_version("16.2 (Debian 16.2-1)"), (16, 2, 0));
        assert_eq!(parse_version("garbage"), (0, 0, 0));
    }

    #[test]
    fn test_classify() {
        let dialect = SqliteDialect::default();
        assert_eq!(classify("SELECT 1", &dialect), StatementKind::Query);
        assert_eq!(
            classify("INSERT INTO t (a) VALUES (?)", &dialect),
            StatementKind::Write
        );
        assert_eq!(
            classify("CREATE TABLE t (a INTEGER)", &dialect),
            StatementKind::Ddl
        );
        assert_eq!(classify("DROP TABLE t", &dialect), StatementKind::Ddl);
        assert_eq!(
            classify("ALTER TABLE t RENAME TO u", &dialect),
            StatementKind::Ddl
        );
        assert_eq!(
            classify("RENAME TABLE a TO b", &dialect),
            StatementKind::Ddl
        );
    }

    #[test]
    fn test_render_query() {
        let dialect = SqliteDialect::default();
        let rendered = render_query(
            "SELECT *   FROM t\n WHERE a = ? AND b = ?",
            &[QueryParam::Int(7), QueryParam::from("x")],
            &dialect,
        );
        assert_eq!(rendered, "SELECT * FROM t WHERE a = 7 AND b = 'x'");

        let rendered = render_query("SELEKT  broken\n ?", &[QueryParam::Int(1)], &dialect);
        assert_eq!(rendered, "SELEKT broken 1");
    }

    #[test]
    fn test_upsert_bind_values() {
        let upsert = UpsertStatement {
            sql: String::new(),
            params: vec![0, 1, 2, 1, 2],
        };
        let values = vec![QueryParam::Int(1), QueryParam::from("a"), QueryParam::from("b")];
        let bound = upsert.bind_values(&values);
        assert_eq!(bound.len(), 5);
        assert_eq!(bound[3], QueryParam::from("a"));
        assert_eq!(bound[4], QueryParam::from("b"));
    }

    #[test]
    fn test_quote_with() {
        assert_eq!(quote_with("a`b", '`', '`'), "`a``b`");
        assert_eq!(quote_with("x]y", '[', ']'), "[x]]y]");
    }
}
