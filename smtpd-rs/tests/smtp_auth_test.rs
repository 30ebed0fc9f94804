//! Integration tests for STARTTLS and SMTP AUTH

mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::{start_server, test_config, Client, RecordingHandler};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use smtpd_rs::security::TlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const USER: &str = "alice@example.org";
const PASSWORD: &str = "s3cret";

/// Server-side TLS config and a client config trusting its certificate
fn tls_pair() -> (TlsConfig, Arc<ClientConfig>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = Certificate(cert.serialize_der().unwrap());
    let key_der = PrivateKey(cert.serialize_private_key_der());

    let server_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(&cert_der).unwrap();
    let client_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (
        TlsConfig::new(Arc::new(server_config)),
        Arc::new(client_config),
    )
}

async fn start_tls_server(handler: Arc<RecordingHandler>) -> (SocketAddr, Arc<ClientConfig>) {
    let (tls, client_config) = tls_pair();
    let addr = start_server(test_config(), handler, Some(tls)).await;
    (addr, client_config)
}

/// Connect, EHLO, STARTTLS and EHLO again over TLS
async fn secure_client(
    addr: SocketAddr,
    client_config: Arc<ClientConfig>,
) -> Client<TlsStream<TcpStream>> {
    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    client.expect("EHLO client.test", 250).await;
    upgrade(client, client_config).await
}

async fn upgrade(
    mut client: Client<TcpStream>,
    client_config: Arc<ClientConfig>,
) -> Client<TlsStream<TcpStream>> {
    client.expect("STARTTLS", 220).await;

    let connector = TlsConnector::from(client_config);
    let server_name = ServerName::try_from("localhost").unwrap();
    let stream = connector
        .connect(server_name, client.into_inner())
        .await
        .unwrap();

    let mut client = Client::new(stream);
    client.expect("EHLO client.test", 250).await;
    client
}

fn plain_response(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", username, password))
}

#[tokio::test]
async fn test_starttls_advertised_only_in_plaintext() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, client_config) = start_tls_server(handler).await;

    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    let (_, lines) = client.expect("EHLO client.test", 250).await;
    assert!(lines.contains(&"STARTTLS".to_string()));
    assert!(!lines.iter().any(|l| l.starts_with("AUTH")));

    client.expect("STARTTLS", 220).await;
    let connector = TlsConnector::from(client_config);
    let stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), client.into_inner())
        .await
        .unwrap();
    let mut client = Client::new(stream);

    // The upgrade forgets the earlier EHLO
    client.expect("MAIL FROM:<a@example.org>", 503).await;

    let (_, lines) = client.expect("EHLO client.test", 250).await;
    assert!(!lines.contains(&"STARTTLS".to_string()));
    assert!(lines.contains(&"AUTH PLAIN LOGIN".to_string()));

    client.expect("STARTTLS", 503).await;
}

#[tokio::test]
async fn test_starttls_without_tls_config() {
    let handler = Arc::new(RecordingHandler::default());
    let addr = start_server(test_config(), handler, None).await;

    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    client.expect("STARTTLS", 502).await;
}

#[tokio::test]
async fn test_starttls_before_helo() {
    let handler = Arc::new(RecordingHandler::default());
    let (addr, client_config) = start_tls_server(handler).await;

    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    let mut client = upgrade(client, client_config).await;
    client.expect("NOOP", 250).await;
}

#[tokio::test]
async fn test_rset_keeps_tls() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, client_config) = start_tls_server(handler).await;
    let mut client = secure_client(addr, client_config).await;

    client.expect("MAIL FROM:<alice@example.org>", 250).await;
    client.expect("RSET", 250).await;

    let (_, lines) = client.expect("EHLO client.test", 250).await;
    assert!(!lines.contains(&"STARTTLS".to_string()));
    assert!(lines.contains(&"AUTH PLAIN LOGIN".to_string()));
    client.expect("STARTTLS", 503).await;
}

#[tokio::test]
async fn test_failed_handshake_closes_connection() {
    let handler = Arc::new(RecordingHandler::default());
    let (addr, _) = start_tls_server(handler.clone()).await;

    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    client.expect("EHLO client.test", 250).await;
    client.expect("STARTTLS", 220).await;

    client.send_raw(b"this is not a TLS handshake\r\n").await;
    assert!(client.closes_soon().await);
    assert!(handler.deliveries().is_empty());
}

#[tokio::test]
async fn test_auth_refused_without_tls() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, _) = start_tls_server(handler.clone()).await;

    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    client.expect("EHLO client.test", 250).await;

    let line = format!("AUTH PLAIN {}", plain_response(USER, PASSWORD));
    client.expect(&line, 503).await;
    assert_eq!(handler.auth_count(), 0);
}

#[tokio::test]
async fn test_auth_plain_success() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, client_config) = start_tls_server(handler.clone()).await;
    let mut client = secure_client(addr, client_config).await;

    let line = format!("AUTH PLAIN {}", plain_response(USER, PASSWORD));
    client.expect(&line, 235).await;
    client.expect(&line, 503).await;

    // RSET keeps the authenticated state
    client.expect("RSET", 250).await;
    client.expect(&line, 503).await;
    assert_eq!(handler.auth_count(), 1);

    client.expect("MAIL FROM:<alice@example.org>", 250).await;
    client.expect("RCPT TO:<bob@example.org>", 250).await;
    client.expect("DATA", 354).await;
    client.send_raw(b"over tls\r\n.\r\n").await;
    assert_eq!(client.read_reply().await.0, 250);

    let deliveries = handler.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].username, USER);
    assert_eq!(deliveries[0].envelope.data, b"over tls\r\n");
}

#[tokio::test]
async fn test_auth_plain_with_prompt() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, client_config) = start_tls_server(handler).await;
    let mut client = secure_client(addr, client_config).await;

    let (_, lines) = client.expect("AUTH PLAIN", 334).await;
    assert_eq!(lines, vec![""]);
    client.expect(&plain_response(USER, PASSWORD), 235).await;
}

#[tokio::test]
async fn test_auth_plain_wrong_password() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, client_config) = start_tls_server(handler.clone()).await;
    let mut client = secure_client(addr, client_config).await;

    let line = format!("AUTH PLAIN {}", plain_response(USER, "wrong"));
    client.expect(&line, 535).await;

    // A failed attempt can be retried
    let line = format!("AUTH PLAIN {}", plain_response(USER, PASSWORD));
    client.expect(&line, 235).await;
    assert_eq!(handler.auth_count(), 2);
}

#[tokio::test]
async fn test_auth_login_success() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, client_config) = start_tls_server(handler).await;
    let mut client = secure_client(addr, client_config).await;

    let (_, lines) = client.expect("AUTH LOGIN", 334).await;
    assert_eq!(lines, vec!["VXNlcm5hbWU6"]);
    let (_, lines) = client.expect(&BASE64.encode(USER), 334).await;
    assert_eq!(lines, vec!["UGFzc3dvcmQ6"]);
    client.expect(&BASE64.encode(PASSWORD), 235).await;
}

#[tokio::test]
async fn test_auth_malformed_responses() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, client_config) = start_tls_server(handler.clone()).await;
    let mut client = secure_client(addr, client_config).await;

    client.expect("AUTH PLAIN !!!not-base64!!!", 501).await;

    client.expect("AUTH LOGIN", 334).await;
    client.expect("*", 501).await;

    client.expect("AUTH CRAM-MD5", 504).await;

    assert_eq!(handler.auth_count(), 0);
    client.expect("NOOP", 250).await;
}

#[tokio::test]
async fn test_auth_refused_during_transaction() {
    let handler = Arc::new(RecordingHandler::with_user(USER, PASSWORD));
    let (addr, client_config) = start_tls_server(handler.clone()).await;
    let mut client = secure_client(addr, client_config).await;

    client.expect("MAIL FROM:<alice@example.org>", 250).await;
    let line = format!("AUTH PLAIN {}", plain_response(USER, PASSWORD));
    client.expect(&line, 503).await;
    assert_eq!(handler.auth_count(), 0);
}

#[tokio::test]
async fn test_force_tls() {
    let handler = Arc::new(RecordingHandler::default());
    let (tls, client_config) = tls_pair();
    let mut config = test_config();
    config.force_tls = true;
    let addr = start_server(config, handler, Some(tls)).await;

    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    client.expect("EHLO client.test", 250).await;
    client.expect("MAIL FROM:<alice@example.org>", 530).await;

    let mut client = upgrade(client, client_config).await;
    client.expect("MAIL FROM:<alice@example.org>", 250).await;
}
