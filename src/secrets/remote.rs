use std::error::Error;
use std::path::{Path, PathBuf};

use reqwest::blocking::Client;
use serde::Deserialize;

use super::SecretsError;

/// One entry returned by a shared secrets source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSecret {
    pub name: String,
    pub value: String,
}

/// A shared secrets source reachable through a single "list secrets" call.
pub trait ListSecrets {
    fn list_secrets(&self) -> Result<Vec<RemoteSecret>, SecretsError>;

    /// Human-readable location for logs and errors.
    fn describe(&self) -> String;
}

#[derive(Debug, Deserialize)]
struct WireSecret {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireBody {
    List(Vec<WireSecret>),
    Wrapped { data: Vec<WireSecret> },
}

impl From<WireSecret> for RemoteSecret {
    fn from(w: WireSecret) -> Self {
        let value = match w.value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        Self {
            name: w.name,
            value,
        }
    }
}

/// PEM material presented to the remote server.
pub struct ClientIdentity {
    identity_pem: Vec<u8>,
    ca_pem: Option<Vec<u8>>,
}

impl ClientIdentity {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: Option<Vec<u8>>) -> Self {
        let mut identity_pem = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
        identity_pem.extend_from_slice(key_pem);
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(cert_pem);
        Self {
            identity_pem,
            ca_pem,
        }
    }

    /// Load `cert.pem`, `key.pem` and the optional `ca.pem` from `dir`.
    pub fn load(dir: &Path) -> Result<Self, SecretsError> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read(&path).map_err(|err| {
                SecretsError::Remote(format!(
                    "failed reading client certificate file '{}': {}",
                    path.display(),
                    err
                ))
            })
        };
        let cert_pem = read("cert.pem")?;
        let key_pem = read("key.pem")?;
        let ca_path = dir.join("ca.pem");
        let ca_pem = if ca_path.exists() {
            Some(read("ca.pem")?)
        } else {
            None
        };
        Ok(Self::from_pem(&cert_pem, &key_pem, ca_pem))
    }
}

/// HTTPS client for the shared secrets endpoint, authenticated with the
/// developer's client certificate.
///
/// The certificate is read and the connection built on each call; nothing is
/// cached between resolutions.
pub struct RemoteSecretsClient {
    url: String,
    cert_dir: PathBuf,
}

impl RemoteSecretsClient {
    pub fn new(url: &str, cert_dir: PathBuf) -> Result<Self, SecretsError> {
        let parsed = reqwest::Url::parse(url.trim())
            .map_err(|_| SecretsError::Remote(format!("invalid secrets url '{}'", url)))?;
        if parsed.scheme() != "https" {
            return Err(SecretsError::Remote(format!(
                "secrets url '{}' must use https",
                url
            )));
        }
        Ok(Self {
            url: parsed.to_string(),
            cert_dir,
        })
    }

    fn build_client(&self) -> Result<Client, SecretsError> {
        let identity = ClientIdentity::load(&self.cert_dir)?;
        build_mtls_client(&identity)
    }
}

pub(crate) fn build_mtls_client(identity: &ClientIdentity) -> Result<Client, SecretsError> {
    let pem_identity = reqwest::Identity::from_pem(&identity.identity_pem).map_err(|err| {
        SecretsError::Remote(format!("invalid client certificate: {}", format_reqwest_error(&err)))
    })?;
    let mut builder = Client::builder().use_rustls_tls().identity(pem_identity);
    if let Some(ca_pem) = identity.ca_pem.as_deref() {
        let cert = reqwest::Certificate::from_pem(ca_pem).map_err(|err| {
            SecretsError::Remote(format!("invalid CA certificate: {}", format_reqwest_error(&err)))
        })?;
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|err| SecretsError::Remote(format_reqwest_error(&err)))
}

pub(crate) fn fetch_secrets(client: &Client, url: &str) -> Result<Vec<RemoteSecret>, SecretsError> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .map_err(|err| SecretsError::Remote(format_reqwest_error(&err)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(SecretsError::Remote(format!(
            "{} returned HTTP {}",
            url, status
        )));
    }
    let body: WireBody = response
        .json()
        .map_err(|err| SecretsError::Remote(format!("invalid response body: {}", err)))?;
    let entries = match body {
        WireBody::List(list) => list,
        WireBody::Wrapped { data } => data,
    };
    Ok(entries.into_iter().map(RemoteSecret::from).collect())
}

impl ListSecrets for RemoteSecretsClient {
    fn list_secrets(&self) -> Result<Vec<RemoteSecret>, SecretsError> {
        tracing::debug!(url = %self.url, "fetching shared secrets");
        let client = self.build_client()?;
        fetch_secrets(&client, &self.url)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn format_reqwest_error(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut current: Option<&(dyn Error + 'static)> = error.source();
    while let Some(source) = current {
        message.push_str(": ");
        message.push_str(&source.to_string());
        current = source.source();
    }
    message
}
