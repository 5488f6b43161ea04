//! Value Codec
//!
//! Compact binary encoding for values shipped to remote backends. Values are
//! MessagePack-encoded; if that fails the JSON codec is used instead. A one
//! byte header records which codec produced the payload.

use std::io::Cursor;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{CacheError, Result};

const HEADER_MSGPACK: u8 = 0x01;
const HEADER_JSON: u8 = 0x02;

/// Encodes a value with the primary codec, falling back to JSON.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    match rmp_serde::to_vec_named(value) {
        Ok(body) => Ok(with_header(HEADER_MSGPACK, body)),
        Err(err) => {
            debug!(error = %err, "msgpack encode failed, falling back to json");
            let body = serde_json::to_vec(value)?;
            Ok(with_header(HEADER_JSON, body))
        }
    }
}

/// Decodes a payload produced by [`encode`].
///
/// Payloads without a recognised header (written by other clients) are tried
/// as MessagePack, then JSON, and finally returned as a string.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    match bytes.split_first() {
        Some((&HEADER_MSGPACK, body)) => rmp_serde::from_slice(body)
            .map_err(|e| CacheError::Serialization(format!("msgpack decode: {}", e))),
        Some((&HEADER_JSON, body)) => Ok(serde_json::from_slice(body)?),
        Some(_) => Ok(decode_foreign(bytes)),
        None => Err(CacheError::Serialization("empty payload".into())),
    }
}

/// Length of the primary encoding, used for size accounting.
pub fn encoded_len(value: &Value) -> Option<usize> {
    rmp_serde::to_vec_named(value).ok().map(|body| body.len())
}

fn with_header(header: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(header);
    out.extend_from_slice(&body);
    out
}

fn decode_foreign(bytes: &[u8]) -> Value {
    if let Some(value) = decode_msgpack_exact(bytes) {
        return value;
    }
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return value;
    }
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

// Most ASCII bytes are valid msgpack fixints, so a foreign payload only
// counts as msgpack when the decoder consumes all of it.
fn decode_msgpack_exact(bytes: &[u8]) -> Option<Value> {
    let mut cursor = Cursor::new(bytes);
    let value = {
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        Value::deserialize(&mut de).ok()?
    };
    (cursor.position() as usize == bytes.len()).then_some(value)
}
