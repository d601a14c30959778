//! `ccagent_secret_key` hashing.
//!
//! Secrets are never stored or compared in the clear: the gateway hashes
//! the presented key (peppered with the instance-wide static salt from
//! config) and looks up the organization by that hash, mirroring how the
//! dashboard-side rotation endpoint stores the hash in the first place.
//! Grounded in the teacher's existing `sha2` dependency (already pulled in
//! for the same purpose in `andrasbacsai-spacebot`'s content-addressing
//! code) rather than adding a bespoke KDF — a static pepper plus SHA-256 is
//! sufficient here since the secret is a high-entropy generated token, not
//! a user-chosen password.

use sha2::{Digest, Sha256};

/// Hashes `secret_key` with `pepper` into a hex digest suitable for
/// equality lookups (`Datastore::resolve_org_by_secret_hash`).
pub fn hash_secret_key(secret_key: &str, pepper: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(b":");
    hasher.update(secret_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates a fresh random secret key (32 bytes, hex-encoded), returned to
/// the dashboard exactly once at rotation time; only its hash is retained.
pub fn generate_secret_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_pepper_sensitive() {
        let a = hash_secret_key("secret", "pepper-1");
        let b = hash_secret_key("secret", "pepper-1");
        let c = hash_secret_key("secret", "pepper-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(generate_secret_key(), generate_secret_key());
    }
}
