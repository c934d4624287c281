//! Statement and result models.
//!
//! A [`Statement`] is the wire contract shared by the query builder and
//! hand-written SQL: text with `$1, $2, ...` placeholders plus the ordered
//! parameter values.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A typed parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    Text(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Arbitrary JSON document
    Json(JsonValue),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
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

/// Immutable `(text, params)` pair ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    text: String,
    params: Vec<Value>,
}

impl Statement {
    /// Create a statement from text with `$n` placeholders and its parameters.
    pub fn new(text: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            params,
        }
    }

    /// Create a statement without parameters (DDL, migrations, BEGIN/COMMIT).
    pub fn raw(text: impl Into<String>) -> Self {
        Self::new(text, Vec::new())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Rows and affected-row count returned by a driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
    pub rows_affected: u64,
}

impl QueryOutput {
    /// Output of a statement that changed `rows_affected` rows and returned none.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// Get the first row, if any.
    pub fn first(&self) -> Option<&serde_json::Map<String, JsonValue>> {
        self.rows.first()
    }

    /// Get a column of the first row.
    pub fn scalar(&self, column: &str) -> Option<&JsonValue> {
        self.first().and_then(|row| row.get(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_from_conversions() {
        assert_eq!(Value::from(18), Value::Int(18));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from("bob"), Value::Text("bob".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(2.5)), Value::Float(2.5));
    }

    #[test]
    fn test_value_deserialize_untagged() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, true, 7, 1.5, "x", {"a": 1}]"#)
            .expect("valid json");
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Int(7),
                Value::Float(1.5),
                Value::Text("x".to_string()),
                Value::Json(json!({"a": 1})),
            ]
        );
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let json = serde_json::to_string(&Value::Bytes(vec![0xde, 0xad])).expect("serialize");
        assert_eq!(json, "\"3q0=\"");
    }

    #[test]
    fn test_statement_accessors() {
        let stmt = Statement::new("SELECT * FROM t WHERE a = $1", vec![Value::from(1)]);
        assert_eq!(stmt.text(), "SELECT * FROM t WHERE a = $1");
        assert_eq!(stmt.params(), &[Value::Int(1)]);
        assert_eq!(stmt.to_string(), stmt.text());
        assert!(Statement::raw("BEGIN").params().is_empty());
    }

    #[test]
    fn test_query_output_scalar() {
        let mut row = serde_json::Map::new();
        row.insert("balance".to_string(), json!(100));
        let out = QueryOutput {
            rows: vec![row],
            rows_affected: 0,
        };
        assert_eq!(out.scalar("balance"), Some(&json!(100)));
        assert_eq!(out.scalar("missing"), None);
        assert!(QueryOutput::affected(3).first().is_none());
    }
}
