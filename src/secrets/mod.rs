mod file;
mod names;
mod remote;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{Config, ConfigError};
use crate::paths::AifabrixPaths;
use crate::vault::{TokenVault, VaultError};

pub use file::{secure_secrets_file, set_secret};
pub use names::canonical_name;
pub use remote::{ClientIdentity, ListSecrets, RemoteSecret, RemoteSecretsClient};

pub(crate) use file::{load_secrets_file, Presence};

/// Resolved secrets keyed by canonical name.
pub type SecretsMap = BTreeMap<String, String>;

/// Path appended to `remote-server` when no explicit shared source is set.
pub const REMOTE_SECRETS_PATH: &str = "/api/dev/secrets";

#[derive(thiserror::Error, Debug)]
pub enum SecretsError {
    #[error("secrets file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("invalid secrets file {path}: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },
    #[error("failed to read secrets file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write secrets file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no secrets found; create {} with your secret values", user_file.display())]
    NoSecretsFound { user_file: PathBuf },
    #[error(
        "encrypted secrets found ({}) but no encryption key is configured; run 'aifabrix config set-secrets-key <key>'",
        names.join(", ")
    )]
    EncryptedWithoutKey { names: Vec<String> },
    #[error("no secrets encryption key configured; run 'aifabrix config set-secrets-key --generate'")]
    MissingKey,
    #[error("failed to decrypt secret '{name}': {source}")]
    Decryption {
        name: String,
        #[source]
        source: VaultError,
    },
    #[error("remote secrets request failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Project-level secrets shared by the team.
pub enum SharedSource {
    File(PathBuf),
    Remote(Box<dyn ListSecrets>),
}

impl std::fmt::Debug for SharedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Remote(client) => f.debug_tuple("Remote").field(&client.describe()).finish(),
        }
    }
}

fn builtin_defaults() -> SecretsMap {
    [
        ("postgres-password-key-vault", "admin123"),
        ("redis-password-key-vault", ""),
        ("redis-url-key-vault", "redis://${REDIS_HOST}:${REDIS_PORT}"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn is_remote_location(raw: &str) -> bool {
    let lower = raw.trim().to_ascii_lowercase();
    lower.starts_with("https://") || lower.starts_with("http://")
}

/// Cascading secret lookup: explicit file, or user file merged over a shared
/// source, then legacy file, then built-in defaults.
#[derive(Debug)]
pub struct SecretResolver {
    user_file: PathBuf,
    legacy_file: PathBuf,
    shared: Option<SharedSource>,
    defaults: SecretsMap,
    vault: TokenVault,
}

impl SecretResolver {
    pub fn new(user_file: PathBuf, legacy_file: PathBuf, vault: TokenVault) -> Self {
        Self {
            user_file,
            legacy_file,
            shared: None,
            defaults: builtin_defaults(),
            vault,
        }
    }

    /// Assemble the resolver from persisted settings.
    ///
    /// `aifabrix-secrets` selects the shared source: an `https://` URL is
    /// fetched with the developer's client certificate, anything else is a
    /// file path (relative to the config directory). Without it, a configured
    /// `remote-server` implies `<remote-server>/api/dev/secrets`.
    pub fn from_config(config: &Config, paths: &AifabrixPaths) -> Result<Self, SecretsError> {
        let vault = TokenVault::from_config(config)?;
        let mut resolver =
            Self::new(paths.user_secrets_path(), paths.legacy_secrets_path(), vault);
        let cert_dir = paths.cert_dir(config.developer_id.as_str());

        let shared = match (config.secrets_path.as_deref(), config.remote_server.as_deref()) {
            (Some(location), _) if is_remote_location(location) => Some(SharedSource::Remote(
                Box::new(RemoteSecretsClient::new(location, cert_dir)?),
            )),
            (Some(location), _) => Some(SharedSource::File(paths.resolve_relative(location))),
            (None, Some(server)) => {
                let url = format!("{}{}", server.trim_end_matches('/'), REMOTE_SECRETS_PATH);
                Some(SharedSource::Remote(Box::new(RemoteSecretsClient::new(
                    &url, cert_dir,
                )?)))
            }
            (None, None) => None,
        };
        if let Some(shared) = shared {
            resolver = resolver.with_shared(shared);
        }
        Ok(resolver)
    }

    pub fn with_shared(mut self, shared: SharedSource) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Replace the built-in fallback values.
    pub fn with_defaults(mut self, defaults: SecretsMap) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    pub fn user_file(&self) -> &Path {
        &self.user_file
    }

    /// Resolve and decrypt the secrets visible to this invocation.
    pub fn load_secrets(&self, explicit: Option<&Path>) -> Result<SecretsMap, SecretsError> {
        let merged = match explicit {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading explicit secrets file");
                load_secrets_file(path, Presence::Required)?
            }
            None => self.load_cascade()?,
        };
        self.decrypt_all(merged)
    }

    fn load_cascade(&self) -> Result<SecretsMap, SecretsError> {
        let user = load_secrets_file(&self.user_file, Presence::Optional)?;
        let shared = self.load_shared(!user.is_empty())?;
        let merged = merge_user_over_shared(user, shared);
        if !merged.is_empty() {
            return Ok(merged);
        }

        let legacy = load_secrets_file(&self.legacy_file, Presence::Optional)?;
        if !legacy.is_empty() {
            tracing::debug!(path = %self.legacy_file.display(), "using legacy secrets file");
            return Ok(legacy);
        }
        if !self.defaults.is_empty() {
            tracing::debug!("using built-in default secrets");
            return Ok(self.defaults.clone());
        }
        Err(SecretsError::NoSecretsFound {
            user_file: self.user_file.clone(),
        })
    }

    /// Shared values. A shared file that does not exist yet counts as empty;
    /// an unreachable remote is tolerated only when the user file has values.
    fn load_shared(&self, have_user_values: bool) -> Result<SecretsMap, SecretsError> {
        let result = match &self.shared {
            None => return Ok(SecretsMap::new()),
            Some(SharedSource::File(path)) => load_secrets_file(path, Presence::Required),
            Some(SharedSource::Remote(client)) => client.list_secrets().map(|entries| {
                entries
                    .into_iter()
                    .map(|s| (canonical_name(&s.name), s.value))
                    .filter(|(name, _)| !name.is_empty())
                    .collect()
            }),
        };
        match result {
            Ok(map) => Ok(map),
            Err(SecretsError::FileNotFound(path)) => {
                tracing::warn!(path = %path.display(), "shared secrets file not found; skipping");
                Ok(SecretsMap::new())
            }
            Err(err @ SecretsError::Remote(_)) if have_user_values =>
            {
                tracing::warn!(error = %err, "shared secrets unavailable; using user secrets only");
                Ok(SecretsMap::new())
            }
            Err(err) => Err(err),
        }
    }

    fn decrypt_all(&self, secrets: SecretsMap) -> Result<SecretsMap, SecretsError> {
        if !self.vault.has_key() {
            let names: Vec<String> = secrets
                .iter()
                .filter(|(_, v)| TokenVault::is_encrypted(v))
                .map(|(k, _)| k.clone())
                .collect();
            if !names.is_empty() {
                return Err(SecretsError::EncryptedWithoutKey { names });
            }
            return Ok(secrets);
        }

        secrets
            .into_iter()
            .map(|(name, value)| match self.vault.decrypt(&value) {
                Ok(plain) => Ok((name, plain)),
                Err(source) => Err(SecretsError::Decryption { name, source }),
            })
            .collect()
    }
}

fn merge_user_over_shared(user: SecretsMap, mut shared: SecretsMap) -> SecretsMap {
    for (name, value) in user {
        if !value.is_empty() {
            shared.insert(name, value);
        } else {
            shared.entry(name).or_insert(value);
        }
    }
    shared
}
