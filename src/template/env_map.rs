use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde_yaml::Value;

use super::TemplateError;
use crate::config::DeveloperId;

/// Where the rendered configuration will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TargetEnvironment {
    /// Processes on the developer machine, reaching infra through published ports.
    Local,
    /// Containers on the compose network, reaching infra by service name.
    Docker,
}

impl TargetEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for TargetEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const POSTGRES_PORT: u16 = 5432;
pub const REDIS_PORT: u16 = 6379;

/// Host port for `base` on a developer-isolated install.
pub fn offset_port(base: u16, developer_id: &DeveloperId) -> Result<u16, TemplateError> {
    let port = u32::from(base).saturating_add(developer_id.port_offset());
    u16::try_from(port).map_err(|_| TemplateError::PortOutOfRange {
        base,
        developer_id: developer_id.to_string(),
    })
}

/// Variables available to `${VAR}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMap(BTreeMap<String, String>);

impl EnvironmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Infra hosts and ports for `target`, overlaid with the matching section
    /// of an env-config file when one is given.
    pub fn for_target(
        target: TargetEnvironment,
        developer_id: &DeveloperId,
        overrides: Option<&Path>,
    ) -> Result<Self, TemplateError> {
        let mut map = Self::new();
        match target {
            TargetEnvironment::Docker => {
                map.set("DB_HOST", "postgres");
                map.set("DB_PORT", POSTGRES_PORT.to_string());
                map.set("REDIS_HOST", "redis");
                map.set("REDIS_PORT", REDIS_PORT.to_string());
            }
            TargetEnvironment::Local => {
                map.set("DB_HOST", "localhost");
                map.set("DB_PORT", offset_port(POSTGRES_PORT, developer_id)?.to_string());
                map.set("REDIS_HOST", "localhost");
                map.set("REDIS_PORT", offset_port(REDIS_PORT, developer_id)?.to_string());
            }
        }
        map.set("DEVELOPER_ID", developer_id.as_str());

        if let Some(path) = overrides {
            for (key, value) in load_env_config(path, target)? {
                map.set(key, value);
            }
        }
        Ok(map)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn load_env_config(
    path: &Path,
    target: TargetEnvironment,
) -> Result<Vec<(String, String)>, TemplateError> {
    let invalid = |reason: String| TemplateError::EnvConfig {
        path: path.to_path_buf(),
        reason,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let doc: Value = serde_yaml::from_str(&raw).map_err(|e| invalid(e.to_string()))?;

    let section = match doc.get(target.as_str()) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Mapping(section)) => section,
        Some(_) => return Err(invalid(format!("'{}' must be a mapping", target))),
    };

    let mut out = Vec::with_capacity(section.len());
    for (key, value) in section {
        let Some(key) = key.as_str() else {
            return Err(invalid(format!("non-string key in '{}'", target)));
        };
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            _ => return Err(invalid(format!("'{}.{}' must be a scalar", target, key))),
        };
        out.push((key.to_string(), value));
    }
    tracing::debug!(path = %path.display(), %target, count = out.len(), "applied env-config overrides");
    Ok(out)
}
