//! SHA-256 digests used for block, part and transaction identities.
use sha2::{Digest, Sha256};

use crate::macros::fixed_bytes;

fixed_bytes!(Hash, 32);

impl Hash {
    pub fn digest(bytes: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(bytes.as_ref()).into())
    }

    /// Digest over the concatenation of `parts` without allocating.
    pub fn digest_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }
}
