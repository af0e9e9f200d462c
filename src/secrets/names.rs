/// Canonical (kebab-case) form of a secret name.
///
/// camelCase boundaries become `-`, everything is lower-cased, runs of
/// non-alphanumeric characters collapse to a single `-`, and leading/trailing
/// `-` are trimmed.
pub fn canonical_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut pending_sep = false;
    let mut prev: Option<char> = None;

    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            let camel_boundary = ch.is_ascii_uppercase()
                && prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit());
            if (pending_sep || camel_boundary) && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
        prev = Some(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_examples() {
        let cases = [
            ("postgresPasswordKeyVault", "postgres-password-key-vault"),
            ("postgres-passwordKeyVault", "postgres-password-key-vault"),
            ("DATABASE_URL", "database-url"),
            ("  --my__secret..name-- ", "my-secret-name"),
            ("apiKey2", "api-key2"),
            ("v2Token", "v2-token"),
            ("already-canonical", "already-canonical"),
            ("", ""),
        ];
        for (raw, expected) in cases {
            assert_eq!(canonical_name(raw), expected, "{raw}");
        }
    }

    #[test]
    fn canonical_name_is_idempotent() {
        for raw in ["myAppSecret", "A_B_C", "x--y", "redisURL"] {
            let once = canonical_name(raw);
            assert_eq!(canonical_name(&once), once);
        }
    }
}
