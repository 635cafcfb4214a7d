//! Positional parameter binding for tracked queries.
//!
//! Parameters are passed as a slice of [`QueryParam`] and bound in order to
//! `$1..$n` placeholders.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::Postgres;
use sqlx::postgres::PgArguments;
use sqlx::types::Json;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
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
    /// JSON value, bound as jsonb
    Json(JsonValue),
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
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
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

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

/// Bind a parameter to a query.
pub(crate) fn bind_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Build a query with all parameters bound in order.
pub(crate) fn build_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = bind_param(query, param);
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(QueryParam::Null.type_name(), "null");
        assert_eq!(QueryParam::from(7i64).type_name(), "int");
        assert_eq!(QueryParam::from("x").type_name(), "string");
        assert_eq!(
            QueryParam::from(serde_json::json!({"a": 1})).type_name(),
            "json"
        );
    }

    #[test]
    fn test_is_null() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::from(false).is_null());
    }

    #[test]
    fn test_from_conversions() {
        assert!(matches!(QueryParam::from(1i32), QueryParam::Int(1)));
        assert!(matches!(QueryParam::from(1.5f64), QueryParam::Float(_)));
        assert!(matches!(
            QueryParam::from("s".to_string()),
            QueryParam::String(_)
        ));
    }

    #[test]
    fn test_serde_untagged() {
        let params: Vec<QueryParam> = serde_json::from_str(r#"[null, true, 3, "x"]"#).unwrap();
        assert!(params[0].is_null());
        assert!(matches!(params[1], QueryParam::Bool(true)));
        assert!(matches!(params[2], QueryParam::Int(3)));
        assert!(matches!(params[3], QueryParam::String(_)));
    }
}
