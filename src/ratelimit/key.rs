//! Key namespacing for shared stores.

/// Prefix applied to remote keys when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// A caller identity placed inside a store namespace.
///
/// Keys are opaque; two keys are related only if they are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Namespace shared by every key of one deployment
    pub prefix: String,
    /// Caller identity, e.g. a client address
    pub key: String,
}

impl BucketKey {
    /// Create a namespaced key.
    pub fn new(prefix: &str, key: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            key: key.to_string(),
        }
    }

    /// Render as `<prefix>:<key>`.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.prefix, self.key)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_format() {
        let key = BucketKey::new(DEFAULT_KEY_PREFIX, "10.0.0.1");
        assert_eq!(key.to_store_key(), "ratelimit:10.0.0.1");
        assert_eq!(key.to_string(), "ratelimit:10.0.0.1");
    }

    #[test]
    fn test_key_may_contain_separator() {
        let key = BucketKey::new("api", "user:42");
        assert_eq!(key.to_store_key(), "api:user:42");
    }

    #[test]
    fn test_key_equality() {
        assert_eq!(BucketKey::new("a", "k"), BucketKey::new("a", "k"));
        assert_ne!(BucketKey::new("a", "k"), BucketKey::new("b", "k"));
    }
}
