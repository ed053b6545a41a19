//! Canonical SQL fingerprints.
//!
//! A fingerprint is a stable digest of normalised SQL text, used as the
//! prepared-statement cache key. Normalisation collapses insignificant
//! whitespace outside quoted regions so that reformatting a query template
//! does not defeat the cache.

use sha2::{Digest, Sha256};

/// Stable digest of a normalised SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex rendering of the digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of an SQL text.
#[must_use]
pub fn fingerprint(sql: &str) -> Fingerprint {
    let normalized = normalize_sql(sql);
    let digest = Sha256::digest(normalized.as_bytes());
    Fingerprint(hex::encode(digest))
}

/// Collapse runs of whitespace outside quoted regions to single spaces and
/// trim the ends. Quoted literals and identifiers are preserved verbatim.
#[must_use]
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for ch in sql.chars() {
        if let Some(q) = quote {
            out.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                quote = Some(ch);
                out.push(ch);
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("SELECT 1", "SELECT 1")]
    #[case("  SELECT\n\t 1  ", "SELECT 1")]
    #[case("SELECT  'a  b'", "SELECT 'a  b'")]
    #[case("SELECT \"col  x\"  FROM t", "SELECT \"col  x\" FROM t")]
    fn normalisation(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_sql(input), expected);
    }

    #[rstest]
    fn reformatting_preserves_the_fingerprint() {
        let a = fingerprint("SELECT id, name\nFROM users\nWHERE id = ?");
        let b = fingerprint("SELECT id, name FROM users WHERE id = ?");
        assert_eq!(a, b);
    }

    #[rstest]
    fn quoted_content_changes_the_fingerprint() {
        let a = fingerprint("SELECT 'a b'");
        let b = fingerprint("SELECT 'a  b'");
        assert_ne!(a, b);
    }
}
