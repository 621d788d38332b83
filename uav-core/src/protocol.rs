//! Protocol messages: named fields, field names, and the error type shared by all protocols.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{Block, BLOCK_SIZE};

/// Field names used on the wire.
pub mod field {
    pub const ID: &str = "id";
    pub const ERROR: &str = "error";
    /// Enrollment challenge / response.
    pub const C: &str = "C";
    pub const R: &str = "R";
    pub const M0: &str = "M0";
    pub const M1: &str = "M1";
    pub const M2: &str = "M2";
    pub const MK: &str = "MK";
    pub const HASH1: &str = "hash1";
    pub const HASH2: &str = "hash2";
    pub const HASH3: &str = "hash3";
    /// Pre-enrollment challenge or response list.
    pub const DATA: &str = "data";
    /// Target of a credential request or handoff.
    pub const ID_UAV: &str = "idUAV";
    pub const CA: &str = "CA";
    pub const RA: &str = "RA";
    pub const NA: &str = "NA";
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Bytes(#[serde(with = "bytes_hex")] Vec<u8>),
    List(#[serde(with = "list_hex")] Vec<Vec<u8>>),
}

/// A protocol message: a set of named fields. Every message carries the sender's `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    fields: BTreeMap<String, Value>,
}

impl Message {
    /// Message from `sender` with only the `id` field.
    pub fn new(sender: &str) -> Self {
        Self::default().with_text(field::ID, sender)
    }

    /// Error report; receivers treat it the same as a lost message.
    pub fn error(sender: &str, reason: &str) -> Self {
        Self::new(sender).with_text(field::ERROR, reason)
    }

    pub fn with_text(mut self, name: &str, value: &str) -> Self {
        self.fields
            .insert(name.to_string(), Value::Text(value.to_string()));
        self
    }

    pub fn with_block(mut self, name: &str, value: &Block) -> Self {
        self.fields
            .insert(name.to_string(), Value::Bytes(value.to_vec()));
        self
    }

    pub fn with_list(mut self, name: &str, values: &[Block]) -> Self {
        self.fields.insert(
            name.to_string(),
            Value::List(values.iter().map(|v| v.to_vec()).collect()),
        );
        self
    }

    /// Raw access, mainly for tests that tamper with messages in flight.
    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn text(&self, name: &'static str) -> Result<&str, ProtocolError> {
        match self.fields.get(name) {
            Some(Value::Text(s)) => Ok(s),
            _ => Err(ProtocolError::MalformedMessage { field: name }),
        }
    }

    /// Sender id.
    pub fn id(&self) -> Result<&str, ProtocolError> {
        self.text(field::ID)
    }

    /// A 32-byte field.
    pub fn block(&self, name: &'static str) -> Result<Block, ProtocolError> {
        match self.fields.get(name) {
            Some(Value::Bytes(b)) => b
                .as_slice()
                .try_into()
                .map_err(|_| ProtocolError::MalformedMessage { field: name }),
            _ => Err(ProtocolError::MalformedMessage { field: name }),
        }
    }

    /// A list of 32-byte values.
    pub fn list(&self, name: &'static str) -> Result<Vec<Block>, ProtocolError> {
        match self.fields.get(name) {
            Some(Value::List(items)) => items
                .iter()
                .map(|b| -> Result<Block, ProtocolError> {
                    b.as_slice()
                        .try_into()
                        .map_err(|_| ProtocolError::MalformedMessage { field: name })
                })
                .collect(),
            _ => Err(ProtocolError::MalformedMessage { field: name }),
        }
    }

    /// `Err(TransportFailure)` if the peer sent an explicit `error` field.
    pub fn check_error(&self) -> Result<(), ProtocolError> {
        match self.fields.get(field::ERROR) {
            None => Ok(()),
            Some(Value::Text(reason)) => Err(ProtocolError::TransportFailure(format!(
                "peer reported error: {reason}"
            ))),
            Some(_) => Err(ProtocolError::TransportFailure(
                "peer reported error".to_string(),
            )),
        }
    }

    /// Check for an error report, then that the message comes from `expected`.
    pub fn expect_from(&self, expected: &str) -> Result<(), ProtocolError> {
        self.check_error()?;
        let got = self.id()?;
        if got != expected {
            return Err(ProtocolError::UnexpectedPeer {
                expected: expected.to_string(),
                got: got.to_string(),
            });
        }
        Ok(())
    }
}

/// Which proof failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Responder's proof, checked by the initiator.
    Hash1,
    /// Initiator's proof, checked by the responder.
    Hash2,
    /// Responder's acknowledgement.
    Hash3,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Hash1 => f.write_str("hash1"),
            Stage::Hash2 => f.write_str("hash2"),
            Stage::Hash3 => f.write_str("hash3"),
        }
    }
}

/// Run failure. Nothing is retried; the caller decides whether to run the protocol again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: field `{field}` missing or wrong size")]
    MalformedMessage { field: &'static str },
    #[error("proof verification failed at {stage}")]
    HashMismatch { stage: Stage },
    #[error("proof verification failed and no concealed fallback challenge exists")]
    NoFallbackAvailable,
    #[error("unknown peer {0}")]
    PeerUnknown(String),
    #[error("peer {peer} has no `{field}` established")]
    NotEnrolled { peer: String, field: &'static str },
    #[error("expected message from {expected}, got one from {got}")]
    UnexpectedPeer { expected: String, got: String },
    #[error("peer {0} is already known")]
    DuplicatePeer(String),
    #[error("no unused credentials left for {0}")]
    CredentialsExhausted(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

/// Byte values travel as hex in human-readable encodings and as raw bytes otherwise.
mod bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(v))
        } else {
            serializer.serialize_bytes(v)
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        if d.is_human_readable() {
            let s: String = Deserialize::deserialize(d)?;
            hex::decode(s).map_err(serde::de::Error::custom)
        } else {
            Deserialize::deserialize(d)
        }
    }
}

mod list_hex {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            let items: Vec<String> = v.iter().map(hex::encode).collect();
            items.serialize(serializer)
        } else {
            v.serialize(serializer)
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        if d.is_human_readable() {
            let items: Vec<String> = Deserialize::deserialize(d)?;
            items
                .into_iter()
                .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
                .collect()
        } else {
            Deserialize::deserialize(d)
        }
    }
}
