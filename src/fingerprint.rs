use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::Xxh3;

use crate::readers::Row;

/// SHA-256 of the raw file bytes, lowercase hex. This is the identity of a
/// file everywhere in the system: dedup checks, the parse cache, and the
/// sampler seed all key off it.
pub fn file_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();

    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// A uniqueness key for a row, hashed over the normalized values of the given
/// columns. Column order must be stable between callers; the dedup engine
/// sorts the uniqueness columns once up front and reuses that order for both
/// existing and incoming rows.
pub fn row_key(row: &Row, columns: &[String]) -> u64 {
    let mut hasher = Xxh3::new();
    for column in columns {
        let value = row.values.get(column).map(String::as_str).unwrap_or_default();
        hasher.update(normalize(value).as_bytes());
        // separator so ("ab","c") and ("a","bc") hash differently
        hasher.update(&[0x1f]);
    }
    hasher.digest()
}

/// The same key derivation for values that are already projected out of a row,
/// e.g. the existing-key preload from the target table.
pub fn values_key<S: AsRef<str>>(values: &[S]) -> u64 {
    let mut hasher = Xxh3::new();
    for value in values {
        hasher.update(normalize(value.as_ref()).as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.digest()
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// A 64-bit seed derived from a fingerprint, for deterministic sampling.
pub fn fingerprint_seed(fingerprint: &str) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(fingerprint.as_bytes());
    hasher.digest()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        Row {
            source_row_number: 1,
            values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn known_sha256_vector() {
        assert_eq!(
            file_fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn row_keys_normalize_case_and_whitespace() {
        let columns = vec!["email".to_string(), "name".to_string()];
        let a = row(&[("email", "Jane@Example.com "), ("name", "Jane")]);
        let b = row(&[("email", "jane@example.com"), ("name", "  JANE")]);
        assert_eq!(row_key(&a, &columns), row_key(&b, &columns));
    }

    #[test]
    fn row_keys_differ_by_column_boundaries() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let x = row(&[("a", "ab"), ("b", "c")]);
        let y = row(&[("a", "a"), ("b", "bc")]);
        assert_ne!(row_key(&x, &columns), row_key(&y, &columns));
    }

    #[test]
    fn values_key_matches_row_key() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let r = row(&[("a", "One"), ("b", "Two")]);
        assert_eq!(row_key(&r, &columns), values_key(&["one", "two"]));
    }

    #[test]
    fn missing_columns_hash_as_empty() {
        let columns = vec!["a".to_string(), "missing".to_string()];
        let r = row(&[("a", "x")]);
        assert_eq!(row_key(&r, &columns), values_key(&["x", ""]));
    }
}
