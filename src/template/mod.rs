mod env_map;

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::config::DeveloperId;
use crate::secrets::{canonical_name, SecretsMap};

pub use env_map::{offset_port, EnvironmentMap, TargetEnvironment, POSTGRES_PORT, REDIS_PORT};

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
static KV_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"kv://([A-Za-z0-9][A-Za-z0-9_-]*)").expect("valid regex"));
static PORT_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*(?:export[ \t]+)?PORT[ \t]*=).*$").expect("valid regex"));

#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error(
        "missing secrets for '{app}': {}. Add them with 'aifabrix secrets set <name> <value>' or edit your secrets.local.yaml",
        names.join(", ")
    )]
    MissingSecrets { app: String, names: Vec<String> },
    #[error("invalid env-config {path}: {reason}")]
    EnvConfig { path: PathBuf, reason: String },
    #[error("port {base} shifted for developer '{developer_id}' is outside the valid port range")]
    PortOutOfRange { base: u16, developer_id: String },
}

/// Renders env templates: `${VAR}` from an [`EnvironmentMap`], `kv://name`
/// from resolved secrets.
pub struct TemplateResolver;

impl TemplateResolver {
    /// Render `template` for `app`.
    ///
    /// Comment and blank lines pass through untouched. Every unresolved
    /// `kv://` reference on a data line is collected before failing, so the
    /// error lists all of them at once.
    pub fn resolve(
        template: &str,
        secrets: &SecretsMap,
        env: &EnvironmentMap,
        app: &str,
    ) -> Result<String, TemplateError> {
        let lines: Vec<(bool, Cow<'_, str>)> = template
            .split_inclusive('\n')
            .map(|line| {
                if is_data_line(line) {
                    (true, interpolate(line, env))
                } else {
                    (false, Cow::Borrowed(line))
                }
            })
            .collect();

        let mut missing: Vec<String> = Vec::new();
        for (_, line) in lines.iter().filter(|(data, _)| *data) {
            for caps in KV_REF_RE.captures_iter(line) {
                let name = canonical_name(&caps[1]);
                if !secrets.contains_key(&name) && !missing.contains(&name) {
                    missing.push(name);
                }
            }
        }
        if !missing.is_empty() {
            return Err(TemplateError::MissingSecrets {
                app: app.to_string(),
                names: missing,
            });
        }

        let mut rendered = String::with_capacity(template.len());
        for (data, line) in &lines {
            if !data {
                rendered.push_str(line);
                continue;
            }
            let replaced = KV_REF_RE.replace_all(line, |caps: &Captures<'_>| {
                match secrets.get(&canonical_name(&caps[1])) {
                    Some(value) => interpolate(value, env).into_owned(),
                    None => caps[0].to_string(),
                }
            });
            rendered.push_str(&replaced);
        }
        tracing::debug!(app, "rendered env template");
        Ok(rendered)
    }
}

fn is_data_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Substitute known `${VAR}` placeholders; unknown ones stay as written.
pub fn interpolate<'a>(text: &'a str, env: &EnvironmentMap) -> Cow<'a, str> {
    ENV_VAR_RE.replace_all(text, |caps: &Captures<'_>| match env.get(&caps[1]) {
        Some(value) => value.to_string(),
        None => caps[0].to_string(),
    })
}

/// Application port settings from the app's own configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppPorts {
    /// Port the app listens on in its base (shared) local setup.
    pub port: u16,
    /// Port inside the container; falls back to `port`.
    pub container_port: Option<u16>,
}

impl AppPorts {
    pub fn for_target(
        &self,
        target: TargetEnvironment,
        developer_id: &DeveloperId,
    ) -> Result<u16, TemplateError> {
        match target {
            TargetEnvironment::Docker => Ok(self.container_port.unwrap_or(self.port)),
            TargetEnvironment::Local => offset_port(self.port, developer_id),
        }
    }
}

/// Rewrite every `PORT=` line to the port the app listens on for `target`.
pub fn apply_target(
    text: &str,
    target: TargetEnvironment,
    ports: AppPorts,
    developer_id: &DeveloperId,
) -> Result<String, TemplateError> {
    let port = ports.for_target(target, developer_id)?;
    Ok(PORT_LINE_RE
        .replace_all(text, |caps: &Captures<'_>| format!("{}{}", &caps[1], port))
        .into_owned())
}
