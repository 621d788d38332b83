//! Simulated PUF: a per-device secret-salted one-way function.

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::crypto::{self, Block, BLOCK_SIZE};

/// Device function `F(input) = SHA-256(salt ‖ input)`. The salt never leaves the node.
pub struct DeviceFunction {
    salt: [u8; BLOCK_SIZE],
}

impl DeviceFunction {
    /// New function with a random salt.
    pub fn generate() -> Self {
        Self {
            salt: crypto::random_block(),
        }
    }

    /// Function with a known salt (fixtures, or a daemon whose identity must survive restarts).
    pub fn from_salt(salt: [u8; BLOCK_SIZE]) -> Self {
        Self { salt }
    }

    pub fn process(&self, input: &[u8]) -> Block {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(input);
        hasher.finalize().into()
    }
}

impl Drop for DeviceFunction {
    fn drop(&mut self) {
        self.salt.zeroize();
    }
}

impl std::fmt::Debug for DeviceFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFunction").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_salted_sha256() {
        let salt = [0x5au8; 32];
        let x = [0u8; 32];
        let puf = DeviceFunction::from_salt(salt);
        let mut h = Sha256::new();
        h.update(salt);
        h.update(x);
        let expected: Block = h.finalize().into();
        assert_eq!(puf.process(&x), expected);
        assert_eq!(puf.process(&x), puf.process(&x));
    }

    #[test]
    fn distinct_devices_disagree() {
        let a = DeviceFunction::generate();
        let b = DeviceFunction::generate();
        let x = crypto::random_block();
        assert_ne!(a.process(&x), b.process(&x));
    }

    #[test]
    fn whole_input_is_hashed() {
        let puf = DeviceFunction::generate();
        let mut x = [0u8; 32];
        let before = puf.process(&x);
        x[31] = 1;
        assert_ne!(puf.process(&x), before);
    }

    #[test]
    fn debug_hides_salt() {
        let puf = DeviceFunction::from_salt([0xab; 32]);
        assert!(!format!("{puf:?}").contains("171"));
    }
}
