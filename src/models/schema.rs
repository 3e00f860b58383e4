//! Schema-related data models.
//!
//! Vendor-neutral snapshots of a table's structure. Drivers build these on
//! every introspection call and the DDL primitives consume them.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Vendor-neutral column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Int,
    BigInt,
    Float,
    Char10,
    Char20,
    Char100,
    Char254,
    Char500,
    Text,
    LongText,
}

impl DataType {
    pub const ALL: [DataType; 10] = [
        Self::Int,
        Self::BigInt,
        Self::Float,
        Self::Char10,
        Self::Char20,
        Self::Char100,
        Self::Char254,
        Self::Char500,
        Self::Text,
        Self::LongText,
    ];

    /// Fixed-width character buckets, smallest first.
    pub const CHAR_BUCKETS: [DataType; 5] = [
        Self::Char10,
        Self::Char20,
        Self::Char100,
        Self::Char254,
        Self::Char500,
    ];

    /// Width of a `CHARn` type, `None` for everything else.
    pub fn char_length(&self) -> Option<usize> {
        match self {
            Self::Char10 => Some(10),
            Self::Char20 => Some(20),
            Self::Char100 => Some(100),
            Self::Char254 => Some(254),
            Self::Char500 => Some(500),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int | Self::BigInt)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::BigInt | Self::Float)
    }

    pub fn is_string(&self) -> bool {
        !self.is_numeric()
    }

    /// Smallest `CHARn` bucket holding `length` characters.
    ///
    /// Lengths beyond the largest bucket map to `TEXT`.
    pub fn for_char_length(length: usize) -> Self {
        Self::CHAR_BUCKETS
            .into_iter()
            .find(|bucket| bucket.char_length().is_some_and(|n| length <= n))
            .unwrap_or(Self::Text)
    }

    /// Infer a vendor-neutral type from a vendor column type string.
    ///
    /// Lossy: a `VARCHAR(30)` comes back as `CHAR100`.
    pub fn infer(type_name: &str) -> Option<Self> {
        let lower = type_name.trim().to_lowercase();
        let (base, size) = split_type_name(&lower);
        let base = base.trim_end_matches(" unsigned").trim();

        match base {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "int2" | "int4"
            | "serial" => Some(Self::Int),
            "bigint" | "int8" | "bigserial" => Some(Self::BigInt),
            "float" | "float4" | "float8" | "double" | "double precision" | "real"
            | "numeric" | "decimal" | "binary_double" | "binary_float" => Some(Self::Float),
            "number" => Some(infer_oracle_number(size.as_deref())),
            "char" | "varchar" | "varchar2" | "nchar" | "nvarchar" | "nvarchar2" | "bpchar"
            | "character" | "character varying" => match size.as_deref() {
                Some("max") => Some(Self::Text),
                Some(n) => n
                    .split(',')
                    .next()
                    .and_then(|n| n.trim().parse::<usize>().ok())
                    .map(Self::for_char_length),
                None => Some(Self::Text),
            },
            "text" | "ntext" | "tinytext" => Some(Self::Text),
            "mediumtext" | "longtext" | "clob" | "nclob" => Some(Self::LongText),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "INT",
            Self::BigInt => "BIGINT",
            Self::Float => "FLOAT",
            Self::Char10 => "CHAR10",
            Self::Char20 => "CHAR20",
            Self::Char100 => "CHAR100",
            Self::Char254 => "CHAR254",
            Self::Char500 => "CHAR500",
            Self::Text => "TEXT",
            Self::LongText => "LONGTEXT",
        }
    }
}

/// Split `varchar(100)` into (`varchar`, `Some("100")`).
fn split_type_name(type_name: &str) -> (&str, Option<String>) {
    match type_name.find('(') {
        Some(open) => {
            let base = type_name[..open].trim();
            let size = type_name[open + 1..]
                .split(')')
                .next()
                .map(|s| s.trim().to_string());
            (base, size)
        }
        None => (type_name, None),
    }
}

/// Oracle stores every integer as `NUMBER(p,0)`.
fn infer_oracle_number(size: Option<&str>) -> DataType {
    let Some(size) = size else {
        return DataType::Float;
    };
    let mut parts = size.split(',').map(str::trim);
    let precision = parts.next().and_then(|p| p.parse::<u32>().ok());
    let scale = parts.next().and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
    match (precision, scale) {
        (Some(p), 0) if p <= 10 => DataType::Int,
        (Some(_), 0) => DataType::BigInt,
        _ => DataType::Float,
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown data type: {s}"))
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A table snapshot: columns, secondary indexes and primary key columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<TableColumn>,
    pub indexes: Vec<TableIndex>,
    pub keys: Vec<TableKey>,
}

impl Table {
    /// Create an empty table description.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a column definition.
    pub fn with_column(mut self, column: TableColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a secondary index.
    pub fn with_index(mut self, index: TableIndex) -> Self {
        self.indexes.push(index);
        self
    }

    /// Add a primary key column.
    pub fn with_key(mut self, column: impl Into<String>) -> Self {
        self.keys.push(TableKey::new(column));
        self
    }

    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn index(&self, name: &str) -> Option<&TableIndex> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.index(name).is_some()
    }

    /// Primary key column names, in key order.
    pub fn primary_columns(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.column.as_str()).collect()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    /// `None` when the vendor type has no neutral equivalent
    pub data_type: Option<DataType>,
    /// Vendor type as reported by introspection (e.g. `varchar(100)`)
    pub type_sql: String,
    pub nullable: bool,
}

impl TableColumn {
    /// A nullable column of a neutral type.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type: Some(data_type),
            type_sql: String::new(),
            nullable: true,
        }
    }

    /// A column as reported by the engine.
    pub fn introspected(
        name: impl Into<String>,
        type_sql: impl Into<String>,
        nullable: bool,
    ) -> Self {
        let type_sql = type_sql.into();
        Self {
            name: name.into(),
            data_type: DataType::infer(&type_sql),
            type_sql,
            nullable,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn with_data_type(mut self, data_type: Option<DataType>) -> Self {
        self.data_type = data_type;
        self
    }
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableIndex {
    pub name: String,
    /// Comma-joined column list, in index order
    pub description: String,
    pub unique: bool,
}

impl TableIndex {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            unique: false,
        }
    }

    /// Build an index description from an ordered column list.
    pub fn on_columns<S: AsRef<str>>(name: impl Into<String>, columns: &[S]) -> Self {
        let description = columns
            .iter()
            .map(|c| c.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        Self::new(name, description)
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn columns(&self) -> Vec<&str> {
        self.description
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableKey {
    pub column: String,
}

impl TableKey {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_buckets() {
        assert_eq!(DataType::for_char_length(1), DataType::Char10);
        assert_eq!(DataType::for_char_length(10), DataType::Char10);
        assert_eq!(DataType::for_char_length(11), DataType::Char20);
        assert_eq!(DataType::for_char_length(30), DataType::Char100);
        assert_eq!(DataType::for_char_length(254), DataType::Char254);
        assert_eq!(DataType::for_char_length(500), DataType::Char500);
        assert_eq!(DataType::for_char_length(501), DataType::Text);
    }

    #[test]
    fn test_infer_data_type() {
        assert_eq!(DataType::infer("INT(11)"), Some(DataType::Int));
        assert_eq!(DataType::infer("int unsigned"), Some(DataType::Int));
        assert_eq!(DataType::infer("INTEGER"), Some(DataType::Int));
        assert_eq!(DataType::infer("bigint"), Some(DataType::BigInt));
        assert_eq!(DataType::infer("double"), Some(DataType::Float));
        assert_eq!(DataType::infer("REAL"), Some(DataType::Float));
        assert_eq!(DataType::infer("varchar(254)"), Some(DataType::Char254));
        assert_eq!(
            DataType::infer("character varying(20)"),
            Some(DataType::Char20)
        );
        assert_eq!(DataType::infer("VARCHAR2(4000)"), Some(DataType::Text));
        assert_eq!(DataType::infer("nvarchar(max)"), Some(DataType::Text));
        assert_eq!(DataType::infer("longtext"), Some(DataType::LongText));
        assert_eq!(DataType::infer("CLOB"), Some(DataType::LongText));
        assert_eq!(DataType::infer("NUMBER(10,0)"), Some(DataType::Int));
        assert_eq!(DataType::infer("NUMBER(19,0)"), Some(DataType::BigInt));
        assert_eq!(DataType::infer("blob"), None);
    }

    #[test]
    fn test_data_type_parse() {
        for t in DataType::ALL {
            assert_eq!(t.as_str().parse::<DataType>(), Ok(t));
        }
        assert_eq!("char100".parse::<DataType>(), Ok(DataType::Char100));
        assert!("VARCHAR".parse::<DataType>().is_err());
    }

    #[test]
    fn test_table_lookup() {
        let table = Table::new("agp_user")
            .with_column(TableColumn::new("id", DataType::Int).not_null())
            .with_column(TableColumn::new("name", DataType::Char100))
            .with_index(TableIndex::on_columns("ix_name", &["name", "id"]))
            .with_key("id");

        assert!(table.has_column("NAME"));
        assert!(!table.has_column("email"));
        assert!(table.has_index("ix_name"));
        assert_eq!(table.primary_columns(), vec!["id"]);
        assert_eq!(table.index("ix_name").map(|i| i.columns()), Some(vec!["name", "id"]));
    }
}
