//! Derivation of advisory-lock keys from string names.
//!
//! Postgres advisory locks in the two-key space are addressed by a pair of
//! signed 32-bit integers. Callers name locks with arbitrary strings; the
//! name is hashed with SHA-256 and the first two 4-byte words of the digest
//! (little-endian) become the key pair. Identical names always produce
//! identical keys; distinct names collide only with hash-quality probability,
//! so callers must not treat keys as guaranteed-unique.

use sha2::{Digest, Sha256};

/// A two-integer composite advisory-lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub class: i32,
    pub object: i32,
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.class, self.object)
    }
}

/// Derive the advisory-lock key pair for a string name.
///
/// Pure and total: any string, including the empty string, is valid input.
pub fn derive_lock_key(name: &str) -> LockKey {
    let digest = Sha256::digest(name.as_bytes());
    LockKey {
        class: i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]),
        object: i32::from_le_bytes([digest[4], digest[5], digest[6], digest[7]]),
    }
}
