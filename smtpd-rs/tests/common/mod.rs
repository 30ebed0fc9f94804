//! Shared helpers for the SMTP integration tests

#![allow(dead_code)]

use smtpd_rs::config::SmtpConfig;
use smtpd_rs::security::TlsConfig;
use smtpd_rs::smtp::{Envelope, Handler, Peer, PolicyError, SmtpServer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const HOSTNAME: &str = "mx.test";

/// A delivered message and the user authenticated on its session
#[derive(Debug, Clone)]
pub struct Delivery {
    pub username: String,
    pub envelope: Envelope,
}

/// Handler recording every hook call, with switchable rejections
#[derive(Default)]
pub struct RecordingHandler {
    pub connections: AtomicUsize,
    pub auth_calls: AtomicUsize,
    pub deliveries: Mutex<Vec<Delivery>>,
    pub reject_connection: Option<PolicyError>,
    pub reject_helo: Option<PolicyError>,
    pub reject_recipient: Option<PolicyError>,
    pub reject_delivery: Option<PolicyError>,
    pub users: HashMap<String, String>,
}

impl RecordingHandler {
    pub fn with_user(username: &str, password: &str) -> Self {
        let mut users = HashMap::new();
        users.insert(username.to_string(), password.to_string());
        Self {
            users,
            ..Self::default()
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn auth_count(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }
}

fn verdict(rejection: &Option<PolicyError>) -> Result<(), PolicyError> {
    match rejection {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

#[async_trait::async_trait]
impl Handler for RecordingHandler {
    async fn check_connection(&self, _peer: &Peer) -> Result<(), PolicyError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        verdict(&self.reject_connection)
    }

    async fn check_helo(&self, _peer: &Peer) -> Result<(), PolicyError> {
        verdict(&self.reject_helo)
    }

    async fn check_recipient(&self, _peer: &Peer, _addr: &str) -> Result<(), PolicyError> {
        verdict(&self.reject_recipient)
    }

    fn supports_auth(&self) -> bool {
        !self.users.is_empty()
    }

    async fn authenticate(
        &self,
        _peer: &Peer,
        username: &str,
        password: &str,
    ) -> Result<(), PolicyError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        match self.users.get(username) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(PolicyError::other("Invalid credentials")),
        }
    }

    async fn deliver(&self, peer: &Peer, envelope: Envelope) -> Result<(), PolicyError> {
        verdict(&self.reject_delivery)?;
        self.deliveries.lock().unwrap().push(Delivery {
            username: peer.username.clone(),
            envelope,
        });
        Ok(())
    }
}

pub fn test_config() -> SmtpConfig {
    SmtpConfig {
        hostname: Some(HOSTNAME.to_string()),
        ..SmtpConfig::default()
    }
}

/// Serve on an ephemeral port and return its address
pub async fn start_server(
    config: SmtpConfig,
    handler: Arc<RecordingHandler>,
    tls: Option<TlsConfig>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut server = SmtpServer::new(config).with_handler(handler);
    if let Some(tls) = tls {
        server = server.with_tls(tls);
    }

    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    addr
}

/// A reply: code plus the text of each line
pub type Reply = (u16, Vec<String>);

/// Line-oriented SMTP client over a plain or TLS stream
pub struct Client<S> {
    reader: BufReader<S>,
}

impl Client<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self::new(stream)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.reader.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    pub async fn send(&mut self, line: &str) {
        self.send_raw(format!("{}\r\n", line).as_bytes()).await;
    }

    /// Read a complete, possibly multi-line, reply
    pub async fn read_reply(&mut self) -> Reply {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a reply");

            let code = line[..3].parse().unwrap();
            lines.push(line[4..].trim_end().to_string());
            if line.as_bytes()[3] == b' ' {
                return (code, lines);
            }
        }
    }

    pub async fn command(&mut self, line: &str) -> Reply {
        self.send(line).await;
        self.read_reply().await
    }

    pub async fn expect(&mut self, line: &str, code: u16) -> Reply {
        let reply = self.command(line).await;
        assert_eq!(reply.0, code, "unexpected reply to {:?}: {:?}", line, reply.1);
        reply
    }

    /// True once the server has closed its side
    pub async fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(self.reader.read_line(&mut line).await, Ok(0) | Err(_))
    }

    /// Drop whatever the server still sends and report whether it hangs up
    /// within a few seconds
    pub async fn closes_soon(&mut self) -> bool {
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_to_end(&mut rest))
            .await
            .is_ok()
    }
}

/// Connect, check the banner and EHLO
pub async fn greeted_client(addr: SocketAddr) -> Client<TcpStream> {
    let mut client = Client::connect(addr).await;
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 220);
    client.expect("EHLO client.test", 250).await;
    client
}
