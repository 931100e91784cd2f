//! Dialback key derivation and id generation.
//!
//! A dialback key binds a (from, to, stream-id) triple: the initiating side
//! derives it when offering a key, the receiving side re-derives it when the
//! authoritative server calls back with `db:verify`.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Derive the dialback key for a domain pair and stream id.
///
/// Digest input is the exact byte string `"{from} {to} {stream_id}"`.
/// Deterministic: the same triple always yields the same key.
pub fn dialback_key(from: &str, to: &str, stream_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(from.as_bytes());
    hasher.update(b" ");
    hasher.update(to.as_bytes());
    hasher.update(b" ");
    hasher.update(stream_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Map key for per-pair state: `"{from}=={to}"`.
pub fn domain_pair(from: &str, to: &str) -> String {
    format!("{from}=={to}")
}

/// Generate a random stream id (16 bytes, hex).
pub fn generate_stream_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Generate a short alphanumeric id for ping IQs.
pub fn generate_ping_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..9)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let a = dialback_key("proxy", "openfire", "s1");
        let b = dialback_key("proxy", "openfire", "s1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_changes_with_any_component() {
        let base = dialback_key("proxy", "openfire", "s1");
        assert_ne!(base, dialback_key("proxy2", "openfire", "s1"));
        assert_ne!(base, dialback_key("proxy", "openfire2", "s1"));
        assert_ne!(base, dialback_key("proxy", "openfire", "s2"));
    }

    #[test]
    fn key_components_are_space_delimited() {
        // ("ab", "c") and ("a", "bc") must not collide.
        assert_ne!(
            dialback_key("ab", "c", "s1"),
            dialback_key("a", "bc", "s1")
        );
    }

    #[test]
    fn pair_format() {
        assert_eq!(domain_pair("proxy", "openfire"), "proxy==openfire");
    }

    #[test]
    fn stream_ids_are_unique() {
        let a = generate_stream_id();
        let b = generate_stream_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn ping_id_shape() {
        let id = generate_ping_id();
        assert_eq!(id.len(), 9);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
