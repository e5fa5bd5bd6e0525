//! Turns a raw queue payload into zero or more records.
//!
//! An empty result, or an error, means the payload is not worth emitting: the fetcher confirms
//! its transaction straight away and nothing reaches the buffer. More than one record means the
//! payload was split, and every piece shares the payload's correlation.

use bytes::Bytes;

use crate::Error;
use crate::Result;
use crate::message::{Fields, Value};

pub trait Deserializer: Send + Sync {
    fn decode(&self, payload: &Bytes) -> Result<Vec<Fields>>;
}

impl<F> Deserializer for F
where
    F: Fn(&Bytes) -> Result<Vec<Fields>> + Send + Sync,
{
    fn decode(&self, payload: &Bytes) -> Result<Vec<Fields>> {
        self(payload)
    }
}

/// Emits the payload untouched as a single [Value::Bytes] field.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDeserializer;

impl Deserializer for RawDeserializer {
    fn decode(&self, payload: &Bytes) -> Result<Vec<Fields>> {
        Ok(vec![vec![Value::Bytes(payload.clone())]])
    }
}

/// Emits the payload as a single UTF-8 [Value::String] field.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDeserializer;

impl Deserializer for StringDeserializer {
    fn decode(&self, payload: &Bytes) -> Result<Vec<Fields>> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::Decode(format!("Payload is not UTF-8: {e}")))?;
        Ok(vec![vec![Value::String(text.to_string())]])
    }
}

/// Parses the payload as JSON into a single [Value::Json] field. With `split_arrays`, a
/// top-level array becomes one record per element and an empty array becomes no record.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDeserializer {
    split_arrays: bool,
}

impl JsonDeserializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn splitting_arrays() -> Self {
        Self { split_arrays: true }
    }
}

impl Deserializer for JsonDeserializer {
    fn decode(&self, payload: &Bytes) -> Result<Vec<Fields>> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        match value {
            serde_json::Value::Array(elements) if self.split_arrays => Ok(elements
                .into_iter()
                .map(|element| vec![Value::Json(element)])
                .collect()),
            value => Ok(vec![vec![Value::Json(value)]]),
        }
    }
}
