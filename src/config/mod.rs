mod developer_id;
mod tokens;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::paths::AifabrixPaths;
use crate::vault::{EncryptionKey, VaultError};

pub use developer_id::DeveloperId;
pub use tokens::{
    is_token_expired, is_token_expired_at, normalize_controller_url, should_refresh_token,
    should_refresh_token_at, ClientToken, DeviceToken, EnvironmentTokens,
};

pub const DEFAULT_ENVIRONMENT: &str = "dev";

static ENVIRONMENT_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,31}$").expect("valid regex"));

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("invalid developer id '{0}': must be a non-negative digit string or number")]
    InvalidDeveloperId(String),
    #[error("developer id verification failed: expected '{expected}', stored '{actual}'")]
    DeveloperIdVerification { expected: String, actual: String },
    #[error("invalid environment key '{0}': use lowercase letters, digits, '-' or '_' (max 32 chars)")]
    InvalidEnvironmentKey(String),
    #[error("invalid url '{0}': expected an absolute http(s) url")]
    InvalidUrl(String),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Persisted CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub developer_id: DeveloperId,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_encryption: Option<String>,
    #[serde(
        rename = "aifabrix-secrets",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub secrets_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_server: Option<String>,
    #[serde(
        rename = "aifabrix-env-config",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub env_config: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device: BTreeMap<String, DeviceToken>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, EnvironmentTokens>,
    /// Keys owned by other tooling; preserved across rewrites.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            developer_id: DeveloperId::default(),
            environment: default_environment(),
            controller: None,
            secrets_encryption: None,
            secrets_path: None,
            remote_server: None,
            env_config: None,
            device: BTreeMap::new(),
            environments: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

pub fn validate_environment_key(key: &str) -> Result<(), ConfigError> {
    if ENVIRONMENT_KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(ConfigError::InvalidEnvironmentKey(key.to_string()))
    }
}

/// Validate an absolute http(s) url and return its normalized form.
pub fn validate_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    match url::Url::parse(&candidate) {
        Ok(parsed)
            if matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some() =>
        {
            Ok(normalize_controller_url(trimmed))
        }
        _ => Err(ConfigError::InvalidUrl(raw.to_string())),
    }
}

/// Whole-file config persistence.
///
/// Every mutation reloads the file, applies the change in memory and writes
/// the full document back. There is no cross-process lock; the last writer wins.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn discover() -> Self {
        Self::new(AifabrixPaths::discover().config_path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let value = match serde_yaml::from_str::<serde_yaml::Value>(&raw) {
            Ok(serde_yaml::Value::Mapping(map)) => serde_yaml::Value::Mapping(map),
            Ok(serde_yaml::Value::Null) => return Ok(Config::default()),
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "config is not a mapping; using defaults");
                return Ok(Config::default());
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "config is not valid yaml; using defaults");
                return Ok(Config::default());
            }
        };

        serde_yaml::from_value(value).map_err(|err| ConfigError::Invalid {
            path: self.path.clone(),
            reason: err.to_string(),
        })
    }

    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let raw = serde_yaml::to_string(config)?;
        write_durable(&self.path, raw.as_bytes()).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), "config saved");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), ConfigError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Load the latest config, apply `mutate`, and save.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut Config) -> T) -> Result<T, ConfigError> {
        let mut config = self.load()?;
        let out = mutate(&mut config);
        self.save(&config)?;
        Ok(out)
    }

    pub fn developer_id(&self) -> Result<DeveloperId, ConfigError> {
        Ok(self.load()?.developer_id)
    }

    /// Store a developer id and verify the file holds exactly that string.
    pub fn set_developer_id(&self, raw: &str) -> Result<DeveloperId, ConfigError> {
        let id = DeveloperId::parse(raw)?;
        self.update(|cfg| cfg.developer_id = id.clone())?;
        self.verify_developer_id(&id)?;
        Ok(id)
    }

    /// The on-disk scalar must be the exact string, not a number.
    fn verify_developer_id(&self, expected: &DeveloperId) -> Result<(), ConfigError> {
        let stored = self.read_raw_developer_id()?;
        if stored != expected.as_str() {
            return Err(ConfigError::DeveloperIdVerification {
                expected: expected.to_string(),
                actual: stored,
            });
        }
        Ok(())
    }

    fn read_raw_developer_id(&self) -> Result<String, ConfigError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&raw).map_err(|err| ConfigError::Invalid {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        Ok(match value.get("developer-id") {
            Some(serde_yaml::Value::String(s)) => s.clone(),
            Some(serde_yaml::Value::Number(n)) => format!("{} (number)", n),
            Some(other) => format!("{:?}", other),
            None => String::new(),
        })
    }

    pub fn environment(&self) -> Result<String, ConfigError> {
        Ok(self.load()?.environment)
    }

    pub fn set_environment(&self, key: &str) -> Result<String, ConfigError> {
        let key = key.trim();
        validate_environment_key(key)?;
        self.update(|cfg| cfg.environment = key.to_string())?;
        Ok(key.to_string())
    }

    pub fn set_controller(&self, raw: &str) -> Result<String, ConfigError> {
        let url = validate_url(raw)?;
        self.update(|cfg| cfg.controller = Some(url.clone()))?;
        Ok(url)
    }

    pub fn set_remote_server(&self, raw: &str) -> Result<String, ConfigError> {
        let url = validate_url(raw)?;
        self.update(|cfg| cfg.remote_server = Some(url.clone()))?;
        Ok(url)
    }

    /// Store key material; returns the key fingerprint.
    pub fn set_secrets_encryption_key(&self, raw: &str) -> Result<String, ConfigError> {
        let key = EncryptionKey::parse(raw)?;
        let raw = raw.trim().to_string();
        self.update(|cfg| cfg.secrets_encryption = Some(raw))?;
        Ok(key.fingerprint())
    }

    pub fn generate_secrets_encryption_key(&self) -> Result<String, ConfigError> {
        let key = EncryptionKey::generate();
        let hex_key = key.to_hex();
        self.update(|cfg| cfg.secrets_encryption = Some(hex_key))?;
        Ok(key.fingerprint())
    }

    pub fn set_secrets_path(&self, raw: &str) -> Result<(), ConfigError> {
        let value = non_empty(raw);
        self.update(|cfg| cfg.secrets_path = value)
    }

    pub fn set_env_config_path(&self, raw: &str) -> Result<(), ConfigError> {
        let value = non_empty(raw);
        self.update(|cfg| cfg.env_config = value)
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Write via a sibling temp file + rename, then fsync the final file.
pub(crate) fn write_durable(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(err) =
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                {
                    tracing::warn!(
                        dir = %parent.display(),
                        error = %err,
                        "could not restrict directory permissions"
                    );
                }
            }
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    let staged = (|| {
        let mut opts = std::fs::OpenOptions::new();
        opts.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut f = opts.open(&tmp)?;
        f.write_all(contents)?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(err) = staged {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    let f = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    f.sync_all()?;
    Ok(())
}
