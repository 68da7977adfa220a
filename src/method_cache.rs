/*!

# Method cache

A [MethodCache] is a mapping from string keys to small typed values that
an authentication plugin wants to persist across sessions (tokens,
refresh cookies, negotiated parameters). Insertion order does not
matter, but each stored value's exact type must survive a round trip
through the secret store's `STORE` table, so values are carried as a
self-describing tagged [Value].

The on-disk blob layout is bit-exact with the `STORE.value` column
described in the daemon's persisted schema: a null-terminated type tag
followed by the raw value bytes (fixed-width little-endian for numeric
types, UTF-8 plus a trailing NUL for strings, and raw bytes for byte
arrays).
 */
use std::collections::HashMap;

use crate::error::{Error, Result};

/// A single typed value storable in a [MethodCache].
///
/// The variant names track the GVariant-style one-character type tags
/// used on the wire: `b` (bool), `n`/`q` (i16/u16), `i`/`u` (i32/u32),
/// `x`/`t` (i64/u64), `d` (double), `s` (string), `ay` (byte array).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn tag(&self) -> &'static str {
        match self {
            Value::Bool(_) => "b",
            Value::I16(_) => "n",
            Value::U16(_) => "q",
            Value::I32(_) => "i",
            Value::U32(_) => "u",
            Value::I64(_) => "x",
            Value::U64(_) => "t",
            Value::F64(_) => "d",
            Value::Str(_) => "s",
            Value::Bytes(_) => "ay",
        }
    }

    /// Size in bytes of the encoded value payload (not including the tag).
    fn payload_len(&self) -> usize {
        match self {
            Value::Bool(_) => 1,
            Value::I16(_) | Value::U16(_) => 2,
            Value::I32(_) | Value::U32(_) => 4,
            Value::I64(_) | Value::U64(_) | Value::F64(_) => 8,
            Value::Str(s) => s.len() + 1, // trailing NUL
            Value::Bytes(b) => b.len(),
        }
    }

    /// Total encoded size: `len(type_tag) + 1 (NUL) + len(value_bytes)`,
    /// the quantity the daemon sums over a method's entries to enforce
    /// `Db/MaxDataStorage`.
    pub fn encoded_size(&self, key: &str) -> usize {
        key.len() + self.tag().len() + 1 + self.payload_len()
    }

    /// Encode this value as the bit-exact `STORE.value` blob.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.tag().len() + 1 + self.payload_len());
        out.extend_from_slice(self.tag().as_bytes());
        out.push(0);
        match self {
            Value::Bool(b) => out.push(if *b { 1 } else { 0 }),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Str(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Value::Bytes(b) => out.extend_from_slice(b),
        }
        out
    }

    /// Decode a `STORE.value` blob produced by [Value::encode].
    pub fn decode(blob: &[u8]) -> Result<Value> {
        let nul_at = blob
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::InvalidArgument("blob".into(), "missing type tag".into()))?;
        let tag = std::str::from_utf8(&blob[..nul_at])
            .map_err(|_| Error::InvalidArgument("blob".into(), "type tag is not UTF-8".into()))?;
        let payload = &blob[nul_at + 1..];
        let bad = || Error::InvalidArgument("blob".into(), format!("truncated {tag} payload"));
        Ok(match tag {
            "b" => Value::Bool(*payload.first().ok_or_else(bad)? != 0),
            "n" => Value::I16(i16::from_le_bytes(payload.get(..2).ok_or_else(bad)?.try_into().unwrap())),
            "q" => Value::U16(u16::from_le_bytes(payload.get(..2).ok_or_else(bad)?.try_into().unwrap())),
            "i" => Value::I32(i32::from_le_bytes(payload.get(..4).ok_or_else(bad)?.try_into().unwrap())),
            "u" => Value::U32(u32::from_le_bytes(payload.get(..4).ok_or_else(bad)?.try_into().unwrap())),
            "x" => Value::I64(i64::from_le_bytes(payload.get(..8).ok_or_else(bad)?.try_into().unwrap())),
            "t" => Value::U64(u64::from_le_bytes(payload.get(..8).ok_or_else(bad)?.try_into().unwrap())),
            "d" => Value::F64(f64::from_le_bytes(payload.get(..8).ok_or_else(bad)?.try_into().unwrap())),
            "s" => {
                let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
                Value::Str(
                    String::from_utf8(payload[..end].to_vec())
                        .map_err(|_| Error::InvalidArgument("blob".into(), "string is not UTF-8".into()))?,
                )
            }
            "ay" => Value::Bytes(payload.to_vec()),
            other => {
                return Err(Error::InvalidArgument(
                    "blob".into(),
                    format!("unknown type tag {other:?}"),
                ));
            }
        })
    }
}

/// A mapping from key to typed value, as persisted in `STORE` and handed
/// to/from a plugin via `request_initial`'s `cache` argument.
pub type MethodCache = HashMap<String, Value>;

/// Sum, over every entry, of `len(key) + len(type_tag) + 1 + len(value_bytes)`.
///
/// Used by [crate::store::credentials_db::CredentialsDatabase::update_method_data]
/// to enforce the `Db/MaxDataStorage` ceiling before writing.
pub fn encoded_size(cache: &MethodCache) -> usize {
    cache.iter().map(|(k, v)| v.encoded_size(k)).sum()
}
