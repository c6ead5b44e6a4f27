//! Canonical digest function.
//!
//! Every identity in the pipeline (stage digests, content digests, import
//! ids, mapping ids) is derived through [`sha256_hash`] so identical inputs
//! yield identical identities across runs and hosts.

use sha2::{Digest, Sha256};

/// Reserved delimiter between hashed arguments. Arguments must not be
/// reassociated across the boundary, so the delimiter is part of the format.
const ARGS_DELIMITER: &str = ":::";

/// Hash an ordered argument list into a lowercase 64-hex-char digest.
///
/// Order-sensitive: callers that want order-insensitive behavior sort their
/// arguments first. No locale or time dependence.
pub fn sha256_hash<S: AsRef<str>>(args: &[S]) -> String {
    let joined = args.iter().map(|a| a.as_ref()).collect::<Vec<_>>().join(ARGS_DELIMITER);
    sha256_hex(joined.as_bytes())
}

/// Hash raw bytes into a lowercase 64-hex-char digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        let a = sha256_hash(&["from", "alpine:3.14"]);
        let b = sha256_hash(&["from", "alpine:3.14"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_digest_is_order_sensitive() {
        assert_ne!(sha256_hash(&["a", "b"]), sha256_hash(&["b", "a"]));
    }

    #[test]
    fn test_args_are_not_reassociated() {
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(sha256_hash(&["ab", "c"]), sha256_hash(&["a", "bc"]));
        // one argument vs two
        assert_ne!(sha256_hash(&["a"]), sha256_hash(&["a", ""]));
    }
}
