//! Query-related data models.
//!
//! This module defines parameter values, result rows and read requests.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default chunk size for [`Connection::iterate`](crate::db::Connection::iterate).
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

/// A result row: column name to value, keys in lowercase.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Borrow the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render this value as an SQL literal for display purposes only.
    ///
    /// Never used to build executed SQL.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::String(v) => format!("'{}'", v.replace('\'', "''")),
            Self::Bytes(v) => format!("X'{}'", hex::encode(v)),
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for QueryParam {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Inclusive, 0-based row window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowWindow {
    pub start: u64,
    pub end: u64,
}

impl RowWindow {
    /// Build a window from caller-supplied bounds.
    ///
    /// Negative bounds, a missing bound, or `end < start` mean "no window".
    pub fn normalize(start: Option<i64>, end: Option<i64>) -> Option<Self> {
        let start = u64::try_from(start?).ok()?;
        let end = u64::try_from(end?).ok()?;
        (end >= start).then_some(Self { start, end })
    }

    /// Number of rows covered by the window.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A read request against a [`Connection`](crate::db::Connection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Negative values disable windowing
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    /// Default: true
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
    /// Positional escape flags; `false` skips sanitization for that parameter
    #[serde(default)]
    pub escapes: Option<Vec<bool>>,
}

fn default_cacheable() -> bool {
    true
}

impl QueryRequest {
    /// Create a new request with default options.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            start: None,
            end: None,
            cacheable: true,
            escapes: None,
        }
    }

    /// Add a parameter to this query.
    pub fn param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Replace the parameter list.
    pub fn params(mut self, params: Vec<QueryParam>) -> Self {
        self.params = params;
        self
    }

    /// Restrict the result to rows `[start, end]` (0-based, inclusive).
    pub fn window(mut self, start: i64, end: i64) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    /// Enable or disable the result cache for this call.
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Set the positional escape flags.
    pub fn escapes(mut self, escapes: Vec<bool>) -> Self {
        self.escapes = Some(escapes);
        self
    }

    /// The normalized row window, if any.
    pub fn effective_window(&self) -> Option<RowWindow> {
        RowWindow::normalize(self.start, self.end)
    }
}

impl From<&str> for QueryRequest {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

/// One entry of the query log kept by a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedQuery {
    /// Rendered SQL with parameters substituted
    pub query: String,
    pub cached: bool,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::from(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(QueryParam::from("it's").to_sql_literal(), "'it''s'");
        assert_eq!(QueryParam::Null.to_sql_literal(), "NULL");
        assert_eq!(QueryParam::Bytes(vec![0xab, 0x01]).to_sql_literal(), "X'ab01'");
    }

    #[test]
    fn test_window_normalization() {
        assert_eq!(
            RowWindow::normalize(Some(0), Some(9)),
            Some(RowWindow { start: 0, end: 9 })
        );
        assert_eq!(RowWindow::normalize(Some(-1), Some(9)), None);
        assert_eq!(RowWindow::normalize(Some(0), Some(-5)), None);
        assert_eq!(RowWindow::normalize(None, Some(9)), None);
        assert_eq!(RowWindow::normalize(Some(5), Some(4)), None);
        assert_eq!(RowWindow::normalize(Some(5), Some(14)).map(|w| w.len()), Some(10));
    }

    #[test]
    fn test_query_request_defaults() {
        let req = QueryRequest::new("SELECT * FROM agp_user");
        assert!(req.cacheable);
        assert!(req.params.is_empty());
        assert!(req.effective_window().is_none());

        let req = req.param(1).param("x").window(0, 9).cacheable(false);
        assert_eq!(req.params.len(), 2);
        assert!(!req.cacheable);
        assert_eq!(req.effective_window(), Some(RowWindow { start: 0, end: 9 }));
    }
}
