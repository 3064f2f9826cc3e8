use tracing::warn;
use uuid::Uuid;
use crate::query::chain::QueryChain;

pub const ID_LENGTH: usize = 12;
pub const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Base-62 digits of `n`, most significant first
pub fn base62(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(22);
    while n > 0 {
        digits.push(ALPHABET[(n % 62) as usize]);
        n /= 62;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// 12 leading base-62 digits of a 128-bit value
fn encode_id(n: u128) -> String {
    let mut encoded = base62(n);
    if encoded.len() < ID_LENGTH {
        encoded = format!("{:0>width$}", encoded, width = ID_LENGTH);
    }
    encoded.truncate(ID_LENGTH);
    encoded
}

/// ID for a canonical JSON document
pub fn id_from_json(canonical: &str) -> String {
    encode_id(u128::from_be_bytes(md5::compute(canonical.as_bytes()).0))
}

pub fn random_id() -> String {
    encode_id(Uuid::new_v4().as_u128())
}

/// Content-addressed chain ID; falls back to a random ID if the chain cannot be serialized
pub fn derive_chain_id(chain: &QueryChain) -> String {
    match chain.canonical_json() {
        Ok(json) => id_from_json(&json),
        Err(e) => {
            warn!(error = %e, "chain serialization failed, using random id");
            random_id()
        }
    }
}

pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Deterministic RNG seed for shuffle/sample steps
pub fn seed_from_id(id: &str) -> u64 {
    let digest = md5::compute(id.as_bytes()).0;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base62_digits() {
        assert_eq!(base62(0), "0");
        assert_eq!(base62(61), "Z");
        assert_eq!(base62(62), "10");
        assert_eq!(base62(u128::MAX).len(), 22);
    }

    #[test]
    fn test_id_shape() {
        let id = id_from_json(r#"{"a":1}"#);
        assert_eq!(id.len(), ID_LENGTH);
        assert!(is_valid_id(&id));
        assert_eq!(id, id_from_json(r#"{"a":1}"#));
        assert_ne!(id, id_from_json(r#"{"a":2}"#));
    }

    #[test]
    fn test_short_values_padded() {
        assert_eq!(encode_id(1), "000000000001");
    }

    #[test]
    fn test_random_ids_valid_and_distinct() {
        let a = random_id();
        let b = random_id();
        assert!(is_valid_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_ids() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("abc"));
        assert!(!is_valid_id("abcdefghijk-"));
        assert!(!is_valid_id("abcdefghijklm"));
    }

    #[test]
    fn test_seed_is_stable() {
        assert_eq!(seed_from_id("abc"), seed_from_id("abc"));
        assert_ne!(seed_from_id("abc"), seed_from_id("abd"));
    }
}
