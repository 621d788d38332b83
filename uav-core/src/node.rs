//! A swarm node: identifier, device function and peer table.

use crate::crypto::{self, Block};
use crate::puf::DeviceFunction;
use crate::store::{Concealed, PeerStore};

/// Local node. Protocol state machines borrow it mutably for the duration of one step.
#[derive(Debug)]
pub struct Node {
    id: String,
    puf: DeviceFunction,
    peers: PeerStore,
}

impl Node {
    /// Node with a fresh random device function and an empty peer table.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_function(id, DeviceFunction::generate())
    }

    pub fn with_function(id: impl Into<String>, puf: DeviceFunction) -> Self {
        Self {
            id: id.into(),
            puf,
            peers: PeerStore::new(),
        }
    }

    /// Replace the peer table (e.g. loaded from disk).
    pub fn with_peers(mut self, peers: PeerStore) -> Self {
        self.peers = peers;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peers(&self) -> &PeerStore {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerStore {
        &mut self.peers
    }

    /// Evaluate the local device function.
    pub fn puf(&self, input: &Block) -> Block {
        self.puf.process(input)
    }

    /// Hide `value` behind a fresh lock: `secret = F(x_lock) ^ value`.
    pub fn conceal(&self, value: &Block) -> Concealed {
        let x_lock = crypto::random_block();
        let lock = self.puf(&x_lock);
        Concealed {
            x_lock,
            secret: crypto::xor(&lock, value),
        }
    }

    /// Recover a value concealed by this node.
    pub fn reveal(&self, concealed: &Concealed) -> Block {
        crypto::xor(&self.puf(&concealed.x_lock), &concealed.secret)
    }
}
