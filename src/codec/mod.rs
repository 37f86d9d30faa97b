//! Node payload codec
//!
//! The service cannot tell "no payload" apart from "empty payload", so a node that
//! exists without meaningful content is modelled as [`Value::Empty`], distinct from
//! both an absent node (reported as [`crate::Error::NoNode`]) and a node carrying
//! decoded data ([`Value::Data`]). [`PayloadFormat::encode`] and
//! [`PayloadFormat::decode`] are the only path between those states and raw bytes.
//!
//! Bincode writes nothing for zero-sized values (`()`, unit structs), which would
//! read back as `Empty`. Such values are stored as a single pad byte instead;
//! bincode ignores trailing bytes on decode.
//!
//! # Security
//! Node payloads are readable and writable by anyone with access to the service.
//! Decoding is data-only (no code is ever executed), but decoded values are
//! untrusted input and must be validated by the caller.


use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::CodecError;
use crate::Result;

/// Stored in place of a zero-length `Data` payload
const ZERO_SIZED_PAD: u8 = 0;

/// Decoded content of an existing node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<T> {
    /// Node exists but carries no payload
    Empty,
    Data(T),
}

impl<T> Value<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn data(self) -> Option<T> {
        match self {
            Value::Empty => None,
            Value::Data(v) => Some(v),
        }
    }

    pub fn as_data(&self) -> Option<&T> {
        match self {
            Value::Empty => None,
            Value::Data(v) => Some(v),
        }
    }
}

impl<T> From<T> for Value<T> {
    fn from(value: T) -> Self {
        Value::Data(value)
    }
}

/// Serializer used for node payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    #[default]
    Bincode,
    Json,
}

impl PayloadFormat {
    /// `Empty` encodes to a zero-length payload
    pub fn encode<T: Serialize>(
        self,
        value: &Value<T>,
    ) -> Result<Vec<u8>> {
        match value {
            Value::Empty => Ok(Vec::new()),
            Value::Data(v) => self.encode_data(v),
        }
    }

    /// Never returns a zero-length payload
    pub fn encode_data<T: Serialize>(
        self,
        value: &T,
    ) -> Result<Vec<u8>> {
        let mut bytes = match self {
            PayloadFormat::Bincode => bincode::serialize(value).map_err(CodecError::from)?,
            PayloadFormat::Json => serde_json::to_vec(value).map_err(CodecError::from)?,
        };
        if bytes.is_empty() {
            bytes.push(ZERO_SIZED_PAD);
        }
        Ok(bytes)
    }

    /// A zero-length payload decodes to `Empty`
    pub fn decode<T: DeserializeOwned>(
        self,
        bytes: &[u8],
    ) -> Result<Value<T>> {
        if bytes.is_empty() {
            return Ok(Value::Empty);
        }
        let value = match self {
            PayloadFormat::Bincode => bincode::deserialize(bytes).map_err(CodecError::from)?,
            PayloadFormat::Json => serde_json::from_slice(bytes).map_err(CodecError::from)?,
        };
        Ok(Value::Data(value))
    }
}
