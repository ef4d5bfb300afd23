//! Value types flowing between the heap and the index.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A heap column value as seen by opclass extract functions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Datum {
    /// 64-bit integer.
    Int8(i64),
    /// Variable-length byte string (text, bytea).
    Text(Bytes),
    /// One-dimensional array whose elements may be null.
    Array(Vec<Option<Datum>>),
}

impl Datum {
    pub fn text(s: &str) -> Self {
        Datum::Text(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Array of non-null text elements.
    pub fn text_array<S: AsRef<str>>(items: &[S]) -> Self {
        Datum::Array(
            items
                .iter()
                .map(|s| Some(Datum::text(s.as_ref())))
                .collect(),
        )
    }

    /// Array of non-null integer elements.
    pub fn int_array(items: &[i64]) -> Self {
        Datum::Array(items.iter().map(|v| Some(Datum::Int8(*v))).collect())
    }

    /// Encodes a scalar datum as an index key. Integers use a sign-flipped
    /// big-endian form so that byte order equals numeric order.
    pub fn to_key_bytes(&self) -> Bytes {
        match self {
            Datum::Int8(v) => Bytes::copy_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes()),
            Datum::Text(b) => b.clone(),
            Datum::Array(_) => Bytes::new(),
        }
    }
}

/// Storage properties of an index key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyType {
    /// Fixed length, or -1 for variable length.
    pub typlen: i16,
    /// Passed by value rather than by reference.
    pub typbyval: bool,
}

impl KeyType {
    pub const VARLENA: KeyType = KeyType {
        typlen: -1,
        typbyval: false,
    };

    pub const INT8: KeyType = KeyType {
        typlen: 8,
        typbyval: true,
    };
}
