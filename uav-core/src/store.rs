//! Per-peer cryptographic state and the peer table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::Block;
use crate::protocol::ProtocolError;

/// A value hidden behind the local device function: `secret = F(x_lock) ^ value`.
/// Only the holder of the same device function can reveal it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concealed {
    #[serde(with = "hex_32")]
    pub x_lock: Block,
    #[serde(with = "hex_32")]
    pub secret: Block,
}

/// What this node knows about one remote peer. Absent fields were never established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Seed behind the challenge this node issued to the peer.
    #[serde(default, with = "opt_hex_32", skip_serializing_if = "Option::is_none")]
    pub x: Option<Block>,
    /// Challenge this node must answer next.
    #[serde(default, with = "opt_hex_32", skip_serializing_if = "Option::is_none")]
    pub c: Option<Block>,
    /// Response the peer is expected to produce.
    #[serde(default, with = "opt_hex_32", skip_serializing_if = "Option::is_none")]
    pub r: Option<Block>,
    /// One-generation fallback (`xLock`, `secret`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Concealed>,
}

impl PeerRecord {
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Peer table: identifier -> record. Private to one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerStore {
    peers: HashMap<String, PeerRecord>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Record for `id`, or `PeerUnknown`.
    pub fn record(&self, id: &str) -> Result<&PeerRecord, ProtocolError> {
        self.peers
            .get(id)
            .ok_or_else(|| ProtocolError::PeerUnknown(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Insert or replace the record for `id`.
    pub fn insert(&mut self, id: &str, record: PeerRecord) {
        self.peers.insert(id.to_string(), record);
    }

    /// Apply `f` to the record for `id`, creating an empty one first if needed.
    pub fn upsert<F: FnOnce(&mut PeerRecord)>(&mut self, id: &str, f: F) {
        f(self.peers.entry(id.to_string()).or_default());
    }

    /// Apply `f` to an existing record. `PeerUnknown` if there is none.
    pub fn update<F: FnOnce(&mut PeerRecord)>(&mut self, id: &str, f: F) -> Result<(), ProtocolError> {
        let record = self
            .peers
            .get_mut(id)
            .ok_or_else(|| ProtocolError::PeerUnknown(id.to_string()))?;
        f(record);
        Ok(())
    }

    /// Administrative removal; no protocol removes peers.
    pub fn remove(&mut self, id: &str) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PeerRecord)> {
        self.peers.iter().map(|(k, v)| (k.as_str(), v))
    }
}

mod hex_32 {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        let buf = hex::decode(s).map_err(serde::de::Error::custom)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod opt_hex_32 {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let s: Option<String> = Deserialize::deserialize(d)?;
        match s {
            None => Ok(None),
            Some(s) => {
                let buf = hex::decode(s).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = buf
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_block;

    #[test]
    fn missing_peer_is_unknown() {
        let store = PeerStore::new();
        assert!(matches!(
            store.record("B"),
            Err(ProtocolError::PeerUnknown(id)) if id == "B"
        ));
    }

    #[test]
    fn upsert_preserves_other_fields() {
        let mut store = PeerStore::new();
        let x = random_block();
        let c = random_block();
        store.upsert("B", |r| r.x = Some(x));
        store.upsert("B", |r| r.c = Some(c));
        let rec = store.record("B").unwrap();
        assert_eq!(rec.x, Some(x));
        assert_eq!(rec.c, Some(c));
        assert_eq!(rec.r, None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_requires_existing_record() {
        let mut store = PeerStore::new();
        assert!(store.update("B", |r| r.c = None).is_err());
        store.insert("B", PeerRecord::default());
        assert!(store.update("B", |r| r.c = Some([1u8; 32])).is_ok());
        assert_eq!(store.get("B").unwrap().c, Some([1u8; 32]));
    }

    #[test]
    fn remove_is_explicit() {
        let mut store = PeerStore::new();
        store.insert("B", PeerRecord::default());
        assert!(store.remove("B").is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn json_uses_hex_and_omits_absent_fields() {
        let mut store = PeerStore::new();
        store.insert(
            "B",
            PeerRecord {
                c: Some([0xffu8; 32]),
                fallback: Some(Concealed {
                    x_lock: [1u8; 32],
                    secret: [2u8; 32],
                }),
                ..PeerRecord::default()
            },
        );
        let json = serde_json::to_string(&store).unwrap();
        assert!(json.contains(&"ff".repeat(32)));
        assert!(!json.contains("\"x\""));
        let back: PeerStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }

    #[test]
    fn json_rejects_short_values() {
        let bad = r#"{"B":{"c":"abcd"}}"#;
        assert!(serde_json::from_str::<PeerStore>(bad).is_err());
    }
}
