use clap::{ArgAction, Parser, Subcommand};

use crate::template::TargetEnvironment;

#[derive(Debug, Parser)]
#[command(name = "aifabrix")]
#[command(about = "Local developer CLI: config, secrets and env template resolution")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(subcommand)]
    Secrets(SecretsCommand),
    /// Render an env template for an app.
    Resolve {
        #[arg(long)]
        app: String,
        #[arg(long)]
        template: String,
        #[arg(long, value_enum, default_value_t = TargetEnvironment::Local)]
        target: TargetEnvironment,
        /// Use only this secrets file.
        #[arg(long)]
        secrets: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        container_port: Option<u16>,
        /// Write the result here instead of stdout.
        #[arg(long)]
        output: Option<String>,
    },
    #[command(subcommand)]
    Token(TokenCommand),
    /// Remove stored device and client tokens.
    Logout {
        #[arg(long)]
        controller: Option<String>,
        /// Also clear every client token.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
    GetDeveloperId,
    SetDeveloperId { id: String },
    SetEnvironment { environment: String },
    SetController { url: String },
    SetRemoteServer { url: String },
    SetSecretsKey {
        #[arg(required_unless_present = "generate", conflicts_with = "generate")]
        key: Option<String>,
        #[arg(long)]
        generate: bool,
    },
    SetSecretsPath { path: String },
    SetEnvConfig { path: String },
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum SecretsCommand {
    /// List resolved secret names (values are never printed).
    List {
        #[arg(long)]
        path: Option<String>,
    },
    Set {
        name: String,
        value: String,
        #[arg(long)]
        path: Option<String>,
    },
    /// Encrypt every plaintext value in a secrets file.
    Secure {
        #[arg(long)]
        path: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TokenCommand {
    Status {
        #[arg(long)]
        controller: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_resolve_with_defaults() {
        let cli = Cli::try_parse_from([
            "aifabrix", "-vv", "resolve", "--app", "myapp", "--template", "env.template",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Resolve { app, target, .. } => {
                assert_eq!(app, "myapp");
                assert_eq!(target, TargetEnvironment::Local);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn set_secrets_key_requires_key_or_generate() {
        assert!(Cli::try_parse_from(["aifabrix", "config", "set-secrets-key"]).is_err());
        assert!(
            Cli::try_parse_from(["aifabrix", "config", "set-secrets-key", "--generate"]).is_ok()
        );
        assert!(Cli::try_parse_from([
            "aifabrix",
            "config",
            "set-secrets-key",
            "abc",
            "--generate"
        ])
        .is_err());
    }

    #[test]
    fn developer_id_is_kept_as_text() {
        let cli =
            Cli::try_parse_from(["aifabrix", "config", "set-developer-id", "007"]).unwrap();
        match cli.command {
            Command::Config(ConfigCommand::SetDeveloperId { id }) => assert_eq!(id, "007"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
