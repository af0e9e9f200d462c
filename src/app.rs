use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::cli::{Cli, Command, ConfigCommand, SecretsCommand, TokenCommand};
use crate::config::{
    is_token_expired, should_refresh_token, Config, ConfigStore, DeveloperId,
};
use crate::paths::AifabrixPaths;
use crate::secrets::{secure_secrets_file, set_secret, SecretResolver};
use crate::template::{apply_target, AppPorts, EnvironmentMap, TargetEnvironment, TemplateResolver};
use crate::vault::TokenVault;

pub fn run(cli: Cli) -> Result<(), String> {
    let paths = AifabrixPaths::discover();
    let store = ConfigStore::new(paths.config_path.clone());
    tracing::debug!(config = %store.path().display(), "using config");

    match cli.command {
        Command::Config(command) => run_config(&store, &paths, command),
        Command::Secrets(command) => run_secrets(&store, &paths, command),
        Command::Resolve {
            app,
            template,
            target,
            secrets,
            port,
            container_port,
            output,
        } => run_resolve(
            &store,
            &paths,
            ResolveRequest {
                app,
                template: PathBuf::from(template),
                target,
                secrets: secrets.map(PathBuf::from),
                ports: port.map(|port| AppPorts {
                    port,
                    container_port,
                }),
                output: output.map(PathBuf::from),
            },
        ),
        Command::Token(TokenCommand::Status { controller }) => {
            run_token_status(&store, controller.as_deref())
        }
        Command::Logout { controller, all } => run_logout(&store, controller.as_deref(), all),
    }
}

fn run_config(store: &ConfigStore, paths: &AifabrixPaths, command: ConfigCommand) -> Result<(), String> {
    match command {
        ConfigCommand::Show => {
            let config = load_config(store)?;
            print_json(&config_summary(&config, store.path(), paths))
        }
        ConfigCommand::GetDeveloperId => {
            let id = store.developer_id().map_err(|e| e.to_string())?;
            println!("{}", id);
            Ok(())
        }
        ConfigCommand::SetDeveloperId { id } => {
            let id = store.set_developer_id(&id).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "developerId": id }))
        }
        ConfigCommand::SetEnvironment { environment } => {
            let environment = store.set_environment(&environment).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "environment": environment }))
        }
        ConfigCommand::SetController { url } => {
            let controller = store.set_controller(&url).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "controller": controller }))
        }
        ConfigCommand::SetRemoteServer { url } => {
            let server = store.set_remote_server(&url).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "remoteServer": server }))
        }
        ConfigCommand::SetSecretsKey { key, generate } => {
            let fingerprint = match key {
                Some(key) if !generate => store.set_secrets_encryption_key(&key),
                _ => store.generate_secrets_encryption_key(),
            }
            .map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({
                "secretsEncryption": { "configured": true, "fingerprint": fingerprint }
            }))
        }
        ConfigCommand::SetSecretsPath { path } => {
            store.set_secrets_path(&path).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "secretsPath": path.trim() }))
        }
        ConfigCommand::SetEnvConfig { path } => {
            store.set_env_config_path(&path).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "envConfig": path.trim() }))
        }
        ConfigCommand::Clear => {
            store.clear().map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "cleared": store.path().display().to_string() }))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigSummary {
    config_path: String,
    developer_id: String,
    environment: String,
    controller: Option<String>,
    remote_server: Option<String>,
    secrets_path: Option<String>,
    env_config: Option<String>,
    secrets_encryption: KeySummary,
    user_secrets_path: String,
    device_tokens: Vec<String>,
    client_tokens: Vec<String>,
}

#[derive(Debug, Serialize)]
struct KeySummary {
    configured: bool,
    fingerprint: Option<String>,
}

fn config_summary(config: &Config, config_path: &Path, paths: &AifabrixPaths) -> ConfigSummary {
    // Invalid key material is still reported as configured.
    let fingerprint = TokenVault::from_config(config)
        .ok()
        .and_then(|vault| vault.key_fingerprint());
    ConfigSummary {
        config_path: config_path.display().to_string(),
        developer_id: config.developer_id.to_string(),
        environment: config.environment.clone(),
        controller: config.controller.clone(),
        remote_server: config.remote_server.clone(),
        secrets_path: config.secrets_path.clone(),
        env_config: config.env_config.clone(),
        secrets_encryption: KeySummary {
            configured: config.secrets_encryption.is_some(),
            fingerprint,
        },
        user_secrets_path: paths.user_secrets_path().display().to_string(),
        device_tokens: config.device.keys().cloned().collect(),
        client_tokens: config
            .environments
            .iter()
            .flat_map(|(env, tokens)| tokens.clients.keys().map(move |app| format!("{}/{}", env, app)))
            .collect(),
    }
}

fn run_secrets(store: &ConfigStore, paths: &AifabrixPaths, command: SecretsCommand) -> Result<(), String> {
    let config = load_config(store)?;
    match command {
        SecretsCommand::List { path } => {
            let resolver = SecretResolver::from_config(&config, paths).map_err(|e| e.to_string())?;
            let explicit = path.map(PathBuf::from);
            let secrets = resolver
                .load_secrets(explicit.as_deref())
                .map_err(|e| e.to_string())?;
            let names: Vec<&String> = secrets.keys().collect();
            print_json(&serde_json::json!({ "count": names.len(), "names": names }))
        }
        SecretsCommand::Set { name, value, path } => {
            let vault = TokenVault::from_config(&config).map_err(|e| e.to_string())?;
            let target = path
                .map(PathBuf::from)
                .unwrap_or_else(|| paths.user_secrets_path());
            let name = set_secret(&target, &name, &value, &vault).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({
                "name": name,
                "path": target.display().to_string(),
                "encrypted": vault.has_key(),
            }))
        }
        SecretsCommand::Secure { path } => {
            let vault = TokenVault::from_config(&config).map_err(|e| e.to_string())?;
            let target = path
                .map(PathBuf::from)
                .unwrap_or_else(|| paths.user_secrets_path());
            let count = secure_secrets_file(&target, &vault).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({
                "path": target.display().to_string(),
                "encrypted": count,
            }))
        }
    }
}

struct ResolveRequest {
    app: String,
    template: PathBuf,
    target: TargetEnvironment,
    secrets: Option<PathBuf>,
    ports: Option<AppPorts>,
    output: Option<PathBuf>,
}

fn run_resolve(store: &ConfigStore, paths: &AifabrixPaths, req: ResolveRequest) -> Result<(), String> {
    let config = load_config(store)?;
    let rendered = render_env(&config, paths, &req)?;

    match req.output {
        Some(output) => {
            crate::config::write_durable(&output, rendered.as_bytes())
                .map_err(|e| format!("failed to write {}: {}", output.display(), e))?;
            print_json(&serde_json::json!({
                "app": req.app,
                "target": req.target.as_str(),
                "output": output.display().to_string(),
            }))
        }
        None => {
            print!("{}", rendered);
            Ok(())
        }
    }
}

fn render_env(config: &Config, paths: &AifabrixPaths, req: &ResolveRequest) -> Result<String, String> {
    let template = std::fs::read_to_string(&req.template)
        .map_err(|e| format!("failed to read template {}: {}", req.template.display(), e))?;

    let resolver = SecretResolver::from_config(config, paths).map_err(|e| e.to_string())?;
    let secrets = resolver
        .load_secrets(req.secrets.as_deref())
        .map_err(|e| e.to_string())?;

    let env_config = config
        .env_config
        .as_deref()
        .map(|raw| paths.resolve_relative(raw));
    let developer_id: &DeveloperId = &config.developer_id;
    let mut env = EnvironmentMap::for_target(req.target, developer_id, env_config.as_deref())
        .map_err(|e| e.to_string())?;
    if let Some(ports) = req.ports {
        let port = ports
            .for_target(req.target, developer_id)
            .map_err(|e| e.to_string())?;
        env.set("PORT", port.to_string());
    }

    let rendered =
        TemplateResolver::resolve(&template, &secrets, &env, &req.app).map_err(|e| e.to_string())?;
    match req.ports {
        Some(ports) => {
            apply_target(&rendered, req.target, ports, developer_id).map_err(|e| e.to_string())
        }
        None => Ok(rendered),
    }
}

fn run_token_status(store: &ConfigStore, controller: Option<&str>) -> Result<(), String> {
    let config = load_config(store)?;
    let vault = TokenVault::from_config(&config).map_err(|e| e.to_string())?;
    let controller = controller
        .map(str::to_string)
        .or_else(|| config.controller.clone())
        .ok_or_else(|| "no controller configured; pass --controller or run 'aifabrix config set-controller <url>'".to_string())?;

    let device = store
        .device_token(&vault, &controller)
        .map_err(|e| e.to_string())?;
    let device = match device {
        Some(token) => serde_json::json!({
            "present": true,
            "expiresAt": token.expires_at,
            "expired": is_token_expired(token.expires_at.as_deref()),
            "shouldRefresh": should_refresh_token(token.expires_at.as_deref()),
            "hasRefreshToken": token.refresh_token.is_some(),
        }),
        None => serde_json::json!({ "present": false }),
    };

    let clients: Vec<serde_json::Value> = config
        .environments
        .get(&config.environment)
        .map(|env| {
            env.clients
                .iter()
                .map(|(app, client)| {
                    serde_json::json!({
                        "app": app,
                        "controller": client.controller,
                        "expiresAt": client.expires_at,
                        "expired": is_token_expired(client.expires_at.as_deref()),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    print_json(&serde_json::json!({
        "controller": crate::config::normalize_controller_url(&controller),
        "environment": config.environment,
        "device": device,
        "clients": clients,
    }))
}

fn run_logout(store: &ConfigStore, controller: Option<&str>, all: bool) -> Result<(), String> {
    if all {
        let devices = store.clear_all_device_tokens().map_err(|e| e.to_string())?;
        let clients = store.clear_all_client_tokens().map_err(|e| e.to_string())?;
        tracing::info!(devices, clients, "cleared all tokens");
        return print_json(&serde_json::json!({
            "deviceTokensCleared": devices,
            "clientTokensCleared": clients,
        }));
    }

    let controller = match controller {
        Some(controller) => controller.to_string(),
        None => load_config(store)?
            .controller
            .ok_or_else(|| "no controller configured; pass --controller or --all".to_string())?,
    };
    let device = store
        .clear_device_token(&controller)
        .map_err(|e| e.to_string())?;
    let clients = store
        .clear_client_tokens_for_controller(&controller)
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({
        "controller": crate::config::normalize_controller_url(&controller),
        "deviceTokensCleared": usize::from(device),
        "clientTokensCleared": clients,
    }))
}

fn load_config(store: &ConfigStore) -> Result<Config, String> {
    store.load().map_err(|e| e.to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let raw = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", raw);
    Ok(())
}
