use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use super::names::canonical_name;
use super::{SecretsError, SecretsMap};
use crate::vault::{EncryptOutcome, TokenVault};

/// Whether a missing file is an error or just an empty source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Presence {
    Required,
    Optional,
}

fn read_mapping(path: &Path, presence: Presence) -> Result<Option<Mapping>, SecretsError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return match presence {
                Presence::Required => Err(SecretsError::FileNotFound(path.to_path_buf())),
                Presence::Optional => Ok(None),
            };
        }
        Err(source) => {
            return Err(SecretsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let invalid = |reason: String| SecretsError::InvalidFormat {
        path: path.to_path_buf(),
        reason,
    };
    match serde_yaml::from_str::<Value>(&raw).map_err(|e| invalid(e.to_string()))? {
        Value::Mapping(map) => Ok(Some(map)),
        Value::Null if presence == Presence::Optional => Ok(None),
        Value::Null => Err(invalid("file is empty".to_string())),
        _ => Err(invalid("expected a mapping of name to value".to_string())),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Load a flat secrets file into a map keyed by canonical name.
pub(crate) fn load_secrets_file(path: &Path, presence: Presence) -> Result<SecretsMap, SecretsError> {
    let Some(mapping) = read_mapping(path, presence)? else {
        return Ok(SecretsMap::new());
    };

    let mut out = SecretsMap::new();
    let mut spellings: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in &mapping {
        let Some(name) = scalar_to_string(key).filter(|k| !k.is_empty()) else {
            tracing::warn!(path = %path.display(), "skipping secret with a non-scalar name");
            continue;
        };
        let Some(value) = scalar_to_string(value) else {
            tracing::warn!(path = %path.display(), %name, "skipping secret with a nested value");
            continue;
        };
        let canonical = canonical_name(&name);
        if let Some(previous) = spellings.insert(canonical.clone(), name.clone()) {
            tracing::warn!(
                path = %path.display(),
                first = %previous,
                second = %name,
                "secret names collide after normalization; the later one wins"
            );
        }
        out.insert(canonical, value);
    }
    tracing::debug!(path = %path.display(), count = out.len(), "loaded secrets file");
    Ok(out)
}

/// Encrypt every plaintext value of a secrets file in place.
///
/// Keys keep their original spelling. Returns the number of values encrypted.
pub fn secure_secrets_file(path: &Path, vault: &TokenVault) -> Result<usize, SecretsError> {
    if !vault.has_key() {
        return Err(SecretsError::MissingKey);
    }
    let Some(mut mapping) = read_mapping(path, Presence::Required)? else {
        return Ok(0);
    };

    let mut encrypted = 0usize;
    for (key, value) in mapping.iter_mut() {
        let Some(plain) = scalar_to_string(value).filter(|v| !v.is_empty()) else {
            continue;
        };
        match vault.encrypt(&plain) {
            EncryptOutcome::Encrypted(sealed) => {
                *value = Value::String(sealed);
                encrypted += 1;
            }
            EncryptOutcome::Passthrough(_) => {}
            EncryptOutcome::PlaintextFallback { reason, .. } => {
                tracing::warn!(key = ?key, %reason, "value left in plaintext");
            }
        }
    }

    if encrypted > 0 {
        write_mapping(path, mapping)?;
    }
    Ok(encrypted)
}

/// Store one secret in a secrets file, creating the file when needed.
///
/// The value is encrypted when the vault holds a key. Any existing entry with
/// the same canonical name is replaced.
pub fn set_secret(
    path: &Path,
    name: &str,
    value: &str,
    vault: &TokenVault,
) -> Result<String, SecretsError> {
    let canonical = canonical_name(name);
    if canonical.is_empty() {
        return Err(SecretsError::InvalidFormat {
            path: path.to_path_buf(),
            reason: format!("invalid secret name '{}'", name),
        });
    }
    let mut mapping = read_mapping(path, Presence::Optional)?.unwrap_or_default();
    mapping.retain(|key, _| {
        scalar_to_string(key).map(|k| canonical_name(&k)).as_deref() != Some(canonical.as_str())
    });
    let stored = vault.encrypt_or_warn(value, "secret");
    mapping.insert(Value::String(canonical.clone()), Value::String(stored));
    write_mapping(path, mapping)?;
    tracing::debug!(path = %path.display(), name = %canonical, "stored secret");
    Ok(canonical)
}

fn write_mapping(path: &Path, mapping: Mapping) -> Result<(), SecretsError> {
    let raw = serde_yaml::to_string(&Value::Mapping(mapping)).map_err(|e| {
        SecretsError::InvalidFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    crate::config::write_durable(path, raw.as_bytes()).map_err(|source| SecretsError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_secrets_file;
    use crate::vault::EncryptionKey;

    #[test]
    fn loads_flat_mapping_with_canonical_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_secrets_file(
            tmp.path(),
            "s.yaml",
            "postgresPasswordKeyVault: admin\nPORT_NUMBER: 5432\nenabled: true\nempty: ~\nnested:\n  a: b\n",
        );
        let map = load_secrets_file(&path, Presence::Required).unwrap();
        assert_eq!(map["postgres-password-key-vault"], "admin");
        assert_eq!(map["port-number"], "5432");
        assert_eq!(map["enabled"], "true");
        assert_eq!(map["empty"], "");
        assert!(!map.contains_key("nested"));
    }

    #[test]
    fn colliding_spellings_keep_the_later_value() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_secrets_file(
            tmp.path(),
            "s.yaml",
            "db_password: first\ndbPassword: second\n",
        );
        let map = load_secrets_file(&path, Presence::Required).unwrap();
        assert_eq!(map, [("db-password".to_string(), "second".to_string())].into());
    }

    #[test]
    fn missing_file_depends_on_presence() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing.yaml");
        assert!(load_secrets_file(&path, Presence::Optional).unwrap().is_empty());
        assert!(matches!(
            load_secrets_file(&path, Presence::Required),
            Err(SecretsError::FileNotFound(_))
        ));
    }

    #[test]
    fn non_mapping_is_invalid_format() {
        let tmp = tempfile::tempdir().unwrap();
        let list = write_secrets_file(tmp.path(), "list.yaml", "- a\n- b\n");
        assert!(matches!(
            load_secrets_file(&list, Presence::Optional),
            Err(SecretsError::InvalidFormat { .. })
        ));
        let empty = write_secrets_file(tmp.path(), "empty.yaml", "");
        assert!(load_secrets_file(&empty, Presence::Optional).unwrap().is_empty());
        assert!(matches!(
            load_secrets_file(&empty, Presence::Required),
            Err(SecretsError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn secure_secrets_file_encrypts_plaintext_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_secrets_file(
            tmp.path(),
            "secrets.local.yaml",
            "myApiKey: sk-123\nport: 5432\nblank: ''\n",
        );
        let vault = TokenVault::new(Some(EncryptionKey::generate()));

        assert_eq!(secure_secrets_file(&path, &vault).unwrap(), 2);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-123"));
        assert!(raw.contains("myApiKey"));

        // Second pass finds nothing left to encrypt.
        assert_eq!(secure_secrets_file(&path, &vault).unwrap(), 0);

        let map = load_secrets_file(&path, Presence::Required).unwrap();
        assert_eq!(vault.decrypt(&map["my-api-key"]).unwrap(), "sk-123");
        assert_eq!(vault.decrypt(&map["port"]).unwrap(), "5432");
    }

    #[test]
    fn set_secret_replaces_entries_by_canonical_name() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_secrets_file(tmp.path(), "s.yaml", "myApiKey: old\nother: keep\n");

        let name = set_secret(&path, "my_api_key", "new", &TokenVault::default()).unwrap();
        assert_eq!(name, "my-api-key");
        let map = load_secrets_file(&path, Presence::Required).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["my-api-key"], "new");
        assert_eq!(map["other"], "keep");
    }

    #[test]
    fn set_secret_creates_file_and_encrypts_with_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("secrets.local.yaml");
        let vault = TokenVault::new(Some(EncryptionKey::generate()));

        set_secret(&path, "dbPassword", "pw", &vault).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("secure://"));
        assert!(!raw.contains(": pw"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn secure_secrets_file_requires_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_secrets_file(tmp.path(), "s.yaml", "a: b\n");
        assert!(matches!(
            secure_secrets_file(&path, &TokenVault::default()),
            Err(SecretsError::MissingKey)
        ));
    }
}
