//! Records produced from queue items, and the [CorrelationId] that routes their ack/fail back to
//! the server transaction they came from.

use std::fmt;

use bytes::Bytes;

/// One typed field of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "{v:?}"),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Ordered fields of one record.
pub type Fields = Vec<Value>;

/// Which owned endpoint, and which open transaction on it, a record was produced from. The pair
/// is the durable key; transaction ids alone are only unique per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId {
    /// position of the endpoint within the worker's owned endpoints
    pub endpoint_index: usize,
    pub transaction_id: i64,
}

impl CorrelationId {
    pub fn new(endpoint_index: usize, transaction_id: i64) -> Self {
        Self {
            endpoint_index,
            transaction_id,
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.endpoint_index, self.transaction_id)
    }
}

/// A decoded record waiting to be emitted, tagged with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub fields: Fields,
    pub correlation: CorrelationId,
}

impl BufferedRecord {
    pub fn new(fields: Fields, correlation: CorrelationId) -> Self {
        Self {
            fields,
            correlation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from("a"), Value::String("a".to_string()));
        assert_eq!(Value::from(7_i64), Value::Int(7));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(
            Value::from(serde_json::json!({"k": 1})).to_string(),
            r#"{"k":1}"#
        );
        assert_eq!(Value::from(Bytes::from_static(b"xy")).to_string(), r#"b"xy""#);
    }

    #[test]
    fn test_correlation_display() {
        assert_eq!(CorrelationId::new(2, 101).to_string(), "2-101");
    }
}
