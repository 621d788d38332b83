//! Shared primitives: 32-byte blocks, XOR masking, transcript hashing, session-key derivation.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Size of every PUF input/output, nonce, challenge and digest exchanged by the protocols.
pub const BLOCK_SIZE: usize = 32;

/// One 256-bit protocol value.
pub type Block = [u8; BLOCK_SIZE];

/// Fresh random block from the OS generator (seeds, nonces, lock values).
pub fn random_block() -> Block {
    let mut out = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut out);
    out
}

/// Byte-wise XOR of two blocks.
pub fn xor(a: &Block, b: &Block) -> Block {
    let mut out = [0u8; BLOCK_SIZE];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// XOR of three blocks, `a ^ b ^ c`.
pub fn xor3(a: &Block, b: &Block, c: &Block) -> Block {
    xor(&xor(a, b), c)
}

/// Hash accumulator for protocol proofs. Field order is significant: every proof hash in the
/// protocols is defined over a fixed sequence of values, and `finalize` consumes the builder.
#[derive(Clone, Default)]
pub struct Transcript {
    hasher: Sha256,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Append a 32-byte value.
    pub fn block(mut self, value: &Block) -> Self {
        self.hasher.update(value);
        self
    }

    /// Append the raw UTF-8 bytes of an identifier (no length prefix).
    pub fn text(mut self, value: &str) -> Self {
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn finalize(self) -> Block {
        self.hasher.finalize().into()
    }
}

/// Constant-time comparison of a received proof against a locally computed one.
pub fn proofs_match(received: &Block, expected: &Block) -> bool {
    received.ct_eq(expected).into()
}

/// Session key for the key-establishing authentication variant:
/// HKDF-SHA256 with salt = `s`, input key material = `na ‖ nb`, empty info, 32-byte output.
pub fn derive_session_key(na: &Block, nb: &Block, s: &Block) -> Block {
    let mut ikm = [0u8; 2 * BLOCK_SIZE];
    ikm[..BLOCK_SIZE].copy_from_slice(na);
    ikm[BLOCK_SIZE..].copy_from_slice(nb);
    let hk = Hkdf::<Sha256>::new(Some(s), &ikm);
    let mut okm = [0u8; BLOCK_SIZE];
    let res = hk.expand(&[], &mut okm);
    debug_assert!(res.is_ok(), "HKDF expand cannot fail for 32-byte output");
    okm
}
