/// Prefix of every key this gateway issues.
pub const API_KEY_PREFIX: &str = "ipk-";

/// Stored form of a caller key. Plaintext keys are never persisted.
pub fn hash_api_key(api_key: &str) -> String {
    blake3::hash(api_key.trim().as_bytes()).to_hex().to_string()
}

pub fn generate_api_key() -> String {
    format!(
        "{API_KEY_PREFIX}{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_ignores_surrounding_whitespace() {
        assert_eq!(hash_api_key("ipk-abc"), hash_api_key(" ipk-abc\n"));
        assert_ne!(hash_api_key("ipk-abc"), hash_api_key("ipk-abd"));
        assert_eq!(hash_api_key("ipk-abc").len(), 64);
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = generate_api_key();
        assert!(a.starts_with(API_KEY_PREFIX));
        assert_ne!(a, generate_api_key());
    }
}
