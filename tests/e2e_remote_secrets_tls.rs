use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Command, Output};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use serde_json::Value;
use tempfile::TempDir;
use tokio::runtime::Builder as TokioRuntimeBuilder;

async fn list_secrets_handler() -> Json<Value> {
    Json(serde_json::json!({
        "data": [
            { "name": "sharedDbPassword", "value": "team-pw" },
            { "name": "apiKey", "value": "team-key" }
        ]
    }))
}

/// HTTPS listener that only completes handshakes with the trusted client cert.
struct MtlsSecretsServer {
    addr: SocketAddr,
    server_cert_pem: String,
    handle: axum_server::Handle,
    thread: Option<JoinHandle<()>>,
}

impl MtlsSecretsServer {
    fn start(trusted_client: &CertifiedKey) -> Self {
        install_rustls_provider_once();

        let server = generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate server cert");
        let server_cert_pem = server.cert.pem();

        let mut roots = RootCertStore::empty();
        roots
            .add(trusted_client.cert.der().clone())
            .expect("trust client cert");
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .expect("build client verifier");
        let chain: Vec<CertificateDer<'static>> = vec![server.cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server.key_pair.serialize_der()));
        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .expect("server tls config");
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let tls_config = RustlsConfig::from_config(Arc::new(config));

        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        drop(listener);

        let handle = axum_server::Handle::new();
        let handle_for_thread = handle.clone();
        let thread = thread::spawn(move || {
            let runtime = TokioRuntimeBuilder::new_multi_thread()
                .enable_all()
                .build()
                .expect("build tokio runtime");
            runtime.block_on(async move {
                let app = Router::new().route("/api/dev/secrets", get(list_secrets_handler));
                let server = axum_server::bind_rustls(addr, tls_config)
                    .handle(handle_for_thread)
                    .serve(app.into_make_service());
                let _ = server.await;
            });
        });

        wait_until_listener_ready(addr);

        Self {
            addr,
            server_cert_pem,
            handle,
            thread: Some(thread),
        }
    }

    fn base_url(&self) -> String {
        format!("https://localhost:{}", self.addr.port())
    }
}

impl Drop for MtlsSecretsServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn install_rustls_provider_once() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

fn wait_until_listener_ready(addr: SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("mtls listener did not become ready at {}", addr);
}

fn client_identity() -> CertifiedKey {
    generate_simple_self_signed(vec!["aifabrix-developer".to_string()])
        .expect("generate client cert")
}

/// Lay out `<home>/certs/<developer-id>/` with the server CA and, optionally,
/// the developer's client certificate.
fn install_certs(
    home: &Path,
    developer_id: &str,
    server_ca_pem: &str,
    client: Option<&CertifiedKey>,
) {
    let dir = home.join("certs").join(developer_id);
    std::fs::create_dir_all(&dir).expect("create cert dir");
    std::fs::write(dir.join("ca.pem"), server_ca_pem).expect("write ca pem");
    if let Some(client) = client {
        std::fs::write(dir.join("cert.pem"), client.cert.pem()).expect("write client cert");
        std::fs::write(dir.join("key.pem"), client.key_pair.serialize_pem())
            .expect("write client key");
    }
}

fn run_aifabrix(dir: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_aifabrix"))
        .env("AIFABRIX_HOME", dir.path())
        .env_remove("AIFABRIX_CONFIG")
        .args(args)
        .output()
        .expect("failed to run aifabrix binary")
}

fn run_ok(dir: &TempDir, args: &[&str]) -> String {
    let output = run_aifabrix(dir, args);
    assert!(
        output.status.success(),
        "command failed: aifabrix {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn run_err_text(dir: &TempDir, args: &[&str]) -> String {
    let output = run_aifabrix(dir, args);
    assert!(
        !output.status.success(),
        "command unexpectedly succeeded: aifabrix {}\nstdout:\n{}",
        args.join(" "),
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn e2e_remote_secrets_fetched_with_developer_certificate() {
    let client = client_identity();
    let server = MtlsSecretsServer::start(&client);
    let dir = TempDir::new().expect("tempdir");

    run_ok(&dir, &["config", "set-developer-id", "01"]);
    run_ok(&dir, &["config", "set-remote-server", &server.base_url()]);
    install_certs(dir.path(), "01", &server.server_cert_pem, Some(&client));

    let listed: Value =
        serde_json::from_str(&run_ok(&dir, &["secrets", "list"])).expect("json output");
    assert_eq!(
        listed["names"],
        serde_json::json!(["api-key", "shared-db-password"])
    );

    // User values still win over the remote source.
    std::fs::write(dir.path().join("secrets.local.yaml"), "apiKey: mine\n").expect("user secrets");
    let template = dir.path().join("env.template");
    std::fs::write(&template, "API_KEY=kv://api-key\nDB_PASSWORD=kv://shared-db-password\n")
        .expect("template");
    let rendered = run_ok(
        &dir,
        &["resolve", "--app", "x", "--template", &template.display().to_string()],
    );
    assert_eq!(rendered, "API_KEY=mine\nDB_PASSWORD=team-pw\n");
}

#[test]
fn e2e_remote_secrets_rejected_without_developer_certificate() {
    let trusted = client_identity();
    let server = MtlsSecretsServer::start(&trusted);
    let dir = TempDir::new().expect("tempdir");

    let url = format!("{}/api/dev/secrets", server.base_url());
    run_ok(&dir, &["config", "set-secrets-path", &url]);

    // Certificate directory for developer "0" holds only the CA.
    install_certs(dir.path(), "0", &server.server_cert_pem, None);
    let err = run_err_text(&dir, &["secrets", "list"]);
    assert!(err.contains("cert.pem"), "{err}");

    // An untrusted client certificate fails the handshake.
    let stranger = client_identity();
    install_certs(dir.path(), "0", &server.server_cert_pem, Some(&stranger));
    let err = run_err_text(&dir, &["secrets", "list"]);
    assert!(err.contains("remote secrets request failed"), "{err}");
}
