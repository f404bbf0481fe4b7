use sha2::{Digest, Sha256};

/// Compute SHA-256 of an in-memory byte slice as lowercase hex (64 chars).
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash of a whole decoded statement. Identical text gives an identical hash
/// whatever the upload was called.
pub fn content_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Hash over every field of one source record, in column order.
pub fn row_hash<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of empty bytes is a known constant.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash("a,b\n"), content_hash("a,b\n"));
        assert_ne!(content_hash("a,b\n"), content_hash("a,c\n"));
        assert_eq!(content_hash("x").len(), 64);
    }

    #[test]
    fn row_hash_separates_fields() {
        assert_ne!(row_hash(["ab", "c"]), row_hash(["a", "bc"]));
        assert_eq!(row_hash(["a", "b"]), row_hash(vec!["a", "b"]));
    }
}
