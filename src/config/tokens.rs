use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{validate_environment_key, Config, ConfigError, ConfigStore};
use crate::vault::{EncryptOutcome, TokenVault};

const EXPIRY_MARGIN_MINUTES: i64 = 5;
const REFRESH_MARGIN_MINUTES: i64 = 15;

/// Credentials bound to a controller, keyed by normalized controller url.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// Credentials bound to an (environment, application) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientToken {
    pub controller: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentTokens {
    #[serde(default)]
    pub clients: BTreeMap<String, ClientToken>,
}

/// Canonical map key for a controller url.
///
/// Trims, drops trailing slashes, assumes `http://` when no scheme is given and
/// lower-cases scheme and host.
pub fn normalize_controller_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    match url::Url::parse(&with_scheme) {
        Ok(parsed) if parsed.host_str().is_some() => {
            let mut out = format!(
                "{}://{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default()
            );
            if let Some(port) = parsed.port() {
                out.push_str(&format!(":{}", port));
            }
            out.push_str(parsed.path().trim_end_matches('/'));
            out
        }
        _ => with_scheme,
    }
}

fn expires_within(expires_at: Option<&str>, margin: Duration, now: DateTime<Utc>) -> bool {
    let Some(raw) = expires_at.map(str::trim).filter(|s| !s.is_empty()) else {
        return true;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => at.with_timezone(&Utc) <= now + margin,
        Err(_) => true,
    }
}

pub fn is_token_expired_at(expires_at: Option<&str>, now: DateTime<Utc>) -> bool {
    expires_within(expires_at, Duration::minutes(EXPIRY_MARGIN_MINUTES), now)
}

pub fn should_refresh_token_at(expires_at: Option<&str>, now: DateTime<Utc>) -> bool {
    expires_within(expires_at, Duration::minutes(REFRESH_MARGIN_MINUTES), now)
}

/// Expired, or expiring within 5 minutes. Missing/unparsable timestamps count as expired.
pub fn is_token_expired(expires_at: Option<&str>) -> bool {
    is_token_expired_at(expires_at, Utc::now())
}

/// Expiring within 15 minutes.
pub fn should_refresh_token(expires_at: Option<&str>) -> bool {
    should_refresh_token_at(expires_at, Utc::now())
}

/// Encrypt a stored plaintext value in place. Returns true when the record changed.
fn seal_in_place(vault: &TokenVault, value: &mut String, what: &str) -> bool {
    match vault.encrypt(value) {
        EncryptOutcome::Encrypted(sealed) => {
            *value = sealed;
            true
        }
        EncryptOutcome::Passthrough(_) => false,
        EncryptOutcome::PlaintextFallback { reason, .. } => {
            tracing::warn!(%what, %reason, "could not encrypt stored token; left as plaintext");
            false
        }
    }
}

/// Move an entry stored under a non-normalized variant of `normalized`.
fn migrate_device_key(config: &mut Config, normalized: &str) -> bool {
    if config.device.contains_key(normalized) {
        return false;
    }
    let legacy = config
        .device
        .keys()
        .find(|k| normalize_controller_url(k) == normalized)
        .cloned();
    let Some(legacy) = legacy else {
        return false;
    };
    match config.device.remove(&legacy) {
        Some(record) => {
            tracing::debug!(from = %legacy, to = %normalized, "migrated device token key");
            config.device.insert(normalized.to_string(), record);
            true
        }
        None => false,
    }
}

impl ConfigStore {
    /// Device token for `controller`, decrypted.
    ///
    /// Legacy keys are migrated to the normalized url and plaintext values are
    /// encrypted and persisted when a key is configured.
    pub fn device_token(
        &self,
        vault: &TokenVault,
        controller: &str,
    ) -> Result<Option<DeviceToken>, ConfigError> {
        let key = normalize_controller_url(controller);
        let mut config = self.load()?;
        let mut dirty = migrate_device_key(&mut config, &key);

        let Some(stored) = config.device.get_mut(&key) else {
            if dirty {
                self.save(&config)?;
            }
            return Ok(None);
        };

        dirty |= seal_in_place(vault, &mut stored.token, "device token");
        if let Some(refresh) = stored.refresh_token.as_mut() {
            dirty |= seal_in_place(vault, refresh, "device refresh token");
        }
        let token = DeviceToken {
            token: vault.decrypt(&stored.token)?,
            refresh_token: stored
                .refresh_token
                .as_deref()
                .map(|r| vault.decrypt(r))
                .transpose()?,
            expires_at: stored.expires_at.clone(),
        };

        if dirty {
            self.save(&config)?;
        }
        Ok(Some(token))
    }

    pub fn save_device_token(
        &self,
        vault: &TokenVault,
        controller: &str,
        token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<&str>,
    ) -> Result<String, ConfigError> {
        let key = super::validate_url(controller)?;
        let record = DeviceToken {
            token: vault.encrypt_or_warn(token, "device token"),
            refresh_token: refresh_token.map(|r| vault.encrypt_or_warn(r, "device refresh token")),
            expires_at: expires_at.map(str::to_string),
        };
        self.update(|cfg| {
            cfg.device
                .retain(|k, _| k == &key || normalize_controller_url(k) != key);
            cfg.device.insert(key.clone(), record);
        })?;
        Ok(key)
    }

    /// Remove every stored variant of `controller`. Returns whether anything was removed.
    pub fn clear_device_token(&self, controller: &str) -> Result<bool, ConfigError> {
        let key = normalize_controller_url(controller);
        let mut config = self.load()?;
        let before = config.device.len();
        config
            .device
            .retain(|k, _| normalize_controller_url(k) != key);
        let removed = before != config.device.len();
        if removed {
            self.save(&config)?;
        }
        Ok(removed)
    }

    pub fn clear_all_device_tokens(&self) -> Result<usize, ConfigError> {
        let mut config = self.load()?;
        let count = config.device.len();
        if count > 0 {
            config.device.clear();
            self.save(&config)?;
        }
        Ok(count)
    }

    /// Client token for `(environment, app)`, decrypted, migrating plaintext on read.
    pub fn client_token(
        &self,
        vault: &TokenVault,
        environment: &str,
        app: &str,
    ) -> Result<Option<ClientToken>, ConfigError> {
        let mut config = self.load()?;
        let Some(stored) = config
            .environments
            .get_mut(environment)
            .and_then(|env| env.clients.get_mut(app))
        else {
            return Ok(None);
        };

        let dirty = seal_in_place(vault, &mut stored.token, "client token");
        let token = ClientToken {
            controller: stored.controller.clone(),
            token: vault.decrypt(&stored.token)?,
            expires_at: stored.expires_at.clone(),
        };
        if dirty {
            self.save(&config)?;
        }
        Ok(Some(token))
    }

    pub fn save_client_token(
        &self,
        vault: &TokenVault,
        environment: &str,
        app: &str,
        controller: &str,
        token: &str,
        expires_at: Option<&str>,
    ) -> Result<(), ConfigError> {
        validate_environment_key(environment)?;
        let record = ClientToken {
            controller: super::validate_url(controller)?,
            token: vault.encrypt_or_warn(token, "client token"),
            expires_at: expires_at.map(str::to_string),
        };
        self.update(|cfg| {
            cfg.environments
                .entry(environment.to_string())
                .or_default()
                .clients
                .insert(app.to_string(), record);
        })
    }

    pub fn clear_client_token(&self, environment: &str, app: &str) -> Result<bool, ConfigError> {
        let mut config = self.load()?;
        let removed = config
            .environments
            .get_mut(environment)
            .map(|env| env.clients.remove(app).is_some())
            .unwrap_or(false);
        if removed {
            config
                .environments
                .retain(|_, env| !env.clients.is_empty());
            self.save(&config)?;
        }
        Ok(removed)
    }

    pub fn clear_all_client_tokens(&self) -> Result<usize, ConfigError> {
        let mut config = self.load()?;
        let count: usize = config
            .environments
            .values()
            .map(|env| env.clients.len())
            .sum();
        if count > 0 {
            config.environments.clear();
            self.save(&config)?;
        }
        Ok(count)
    }

    /// Remove client tokens issued by `controller` in every environment.
    pub fn clear_client_tokens_for_controller(&self, controller: &str) -> Result<usize, ConfigError> {
        let key = normalize_controller_url(controller);
        let mut config = self.load()?;
        let mut removed = 0usize;
        for env in config.environments.values_mut() {
            let before = env.clients.len();
            env.clients
                .retain(|_, client| normalize_controller_url(&client.controller) != key);
            removed += before - env.clients.len();
        }
        if removed > 0 {
            config
                .environments
                .retain(|_, env| !env.clients.is_empty());
            self.save(&config)?;
        }
        Ok(removed)
    }
}
