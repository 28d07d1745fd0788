/// Split a document key into its `(collection, id)` parts.
///
/// Only the leading collection token (up to the first `:`) routes backend
/// I/O; the remainder passes through untouched. A key without `:` names a
/// collection with an empty id.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once(':') {
        Some((collection, id)) => (collection, id),
        None => (key, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("user:1"), ("user", "1"));
        assert_eq!(split_key("user:a:b"), ("user", "a:b"));
        assert_eq!(split_key("user"), ("user", ""));
        assert_eq!(split_key(":1"), ("", "1"));
    }
}
