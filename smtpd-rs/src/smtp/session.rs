use crate::error::{Result, SmtpdError};
use crate::security::auth::{self, AuthError, AuthMechanism, Credentials};
use crate::smtp::commands::{ParseError, SmtpCommand};
use crate::smtp::envelope::{Peer, Transaction};
use crate::smtp::handler::PolicyError;
use crate::smtp::server::ServerContext;
use crate::smtp::stream::{trim_line_ending, Connection};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Read size while receiving DATA; longer lines arrive in several pieces
const DATA_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    /// Accepted, no banner sent yet
    Connected,
    /// Banner sent, waiting for HELO/EHLO
    Greeted,
    /// HELO/EHLO accepted, no transaction open
    Ready,
    HasSender,
    HasRecipient,
    Closed,
}

/// One client connection and its protocol state
///
/// Commands are handled strictly one at a time: each is read, checked
/// against the current state, passed through the relevant hook and answered
/// before the next line is read.
pub(crate) struct SmtpSession {
    ctx: Arc<ServerContext>,
    conn: Connection,
    peer: Peer,
    transaction: Transaction,
    state: SmtpState,
    authenticated: bool,
}

impl SmtpSession {
    pub fn new(ctx: Arc<ServerContext>, stream: TcpStream, addr: SocketAddr) -> Self {
        let conn = Connection::new(stream, ctx.read_timeout, ctx.write_timeout);
        Self {
            ctx,
            conn,
            peer: Peer::new(addr),
            transaction: Transaction::default(),
            state: SmtpState::Connected,
            authenticated: false,
        }
    }

    /// Drive the session until QUIT, disconnect or a transport error
    pub async fn handle(mut self) -> Result<()> {
        let result = self.serve().await;
        self.conn.close().await;
        result
    }

    /// Turn the client away because the server is at its connection limit
    pub async fn reject_busy(mut self) {
        if let Err(e) = self.conn.reply(450, "Too busy. Try again later.").await {
            debug!("Failed to send busy reply: {}", e);
        }
        self.conn.close().await;
    }

    async fn serve(&mut self) -> Result<()> {
        if !self.welcome().await? {
            return Ok(());
        }

        while self.state != SmtpState::Closed {
            let result = match self.conn.read_line().await {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => {
                    debug!("Client disconnected");
                    return Ok(());
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(SmtpdError::LineTooLong { max }) => {
                    warn!("Line longer than {} bytes", max);
                    self.conn.reply(500, "Line too long").await?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn welcome(&mut self) -> Result<bool> {
        if let Err(e) = self.ctx.handler.check_connection(&self.peer).await {
            warn!("Connection rejected: {}", e);
            self.reply_error(&e, 502).await?;
            return Ok(false);
        }

        let banner = self.ctx.banner.clone();
        self.conn.reply(220, &banner).await?;
        self.state = SmtpState::Greeted;
        Ok(true)
    }

    async fn handle_line(&mut self, line: &str) -> Result<()> {
        if line.get(..4).is_some_and(|verb| verb.eq_ignore_ascii_case("AUTH")) {
            debug!("Received: AUTH ...");
        } else {
            debug!("Received: {}", line);
        }

        let cmd = match SmtpCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(ParseError::Empty) => {
                return self.conn.reply(500, "Syntax error, command unrecognized").await;
            }
            Err(ParseError::Syntax(reason)) => return self.conn.reply(501, reason).await,
        };

        match cmd {
            SmtpCommand::Helo(name) => self.handle_helo(name, false).await,
            SmtpCommand::Ehlo(name) => self.handle_helo(name, true).await,
            SmtpCommand::Noop => self.conn.reply(250, "OK").await,
            SmtpCommand::Quit => {
                info!("QUIT command");
                self.state = SmtpState::Closed;
                let message = format!("{} closing connection", self.ctx.hostname);
                self.conn.reply(221, &message).await
            }
            SmtpCommand::Starttls => self.handle_starttls().await,
            SmtpCommand::Unknown(cmd) => {
                warn!("Unknown command: {}", cmd);
                self.conn.reply(500, "Syntax error, command unrecognized").await
            }
            _ if matches!(self.state, SmtpState::Connected | SmtpState::Greeted) => {
                self.conn.reply(503, "Please introduce yourself first").await
            }
            SmtpCommand::MailFrom(addr, params) => self.handle_mail(addr, params).await,
            SmtpCommand::RcptTo(addr) => self.handle_rcpt(addr).await,
            SmtpCommand::Data => self.handle_data().await,
            SmtpCommand::Rset => {
                info!("RSET command");
                self.transaction.reset();
                self.state = SmtpState::Ready;
                self.conn.reply(250, "OK").await
            }
            SmtpCommand::Auth(mechanism, initial_response) => {
                self.handle_auth(&mechanism, initial_response).await
            }
        }
    }

    async fn handle_helo(&mut self, name: String, extended: bool) -> Result<()> {
        info!("{} from {}", if extended { "EHLO" } else { "HELO" }, name);

        let mut greeted = self.peer.clone();
        greeted.helo_name = name;
        if let Err(e) = self.ctx.handler.check_helo(&greeted).await {
            warn!("HELO rejected: {}", e);
            return self.reply_error(&e, 502).await;
        }

        self.peer = greeted;
        self.transaction.reset();
        self.state = SmtpState::Ready;

        let greeting = format!("{} Hello {}", self.ctx.hostname, self.peer.helo_name);
        if !extended {
            return self.conn.reply(250, &greeting).await;
        }

        let mut lines = vec![greeting];
        lines.extend(self.extensions());
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        self.conn.reply_lines(250, &lines).await
    }

    fn extensions(&self) -> Vec<String> {
        let encrypted = self.conn.is_encrypted();
        let mut extensions = vec![
            format!("SIZE {}", self.ctx.max_message_size),
            "8BITMIME".to_string(),
        ];

        if self.ctx.tls_acceptor.is_some() && !encrypted {
            extensions.push("STARTTLS".to_string());
        }

        if self.ctx.handler.supports_auth() && encrypted {
            extensions.push(format!("AUTH {}", auth::ADVERTISED_MECHANISMS));
        }

        extensions
    }

    async fn handle_mail(&mut self, addr: String, params: Vec<String>) -> Result<()> {
        if self.state != SmtpState::Ready {
            return self.conn.reply(503, "Nested MAIL command").await;
        }

        if self.ctx.force_tls && !self.conn.is_encrypted() {
            warn!("MAIL FROM rejected: TLS required");
            return self
                .conn
                .reply(530, "Must issue a STARTTLS command first")
                .await;
        }

        self.transaction.reset();

        if let Some(size) = SmtpCommand::declared_size(&params) {
            if size > self.ctx.max_message_size {
                warn!("Declared size {} exceeds limit", size);
                let message = format!(
                    "Message size exceeds maximum of {} bytes",
                    self.ctx.max_message_size
                );
                return self.conn.reply(552, &message).await;
            }
        }

        if let Err(e) = self.ctx.handler.check_sender(&self.peer, &addr).await {
            warn!("Sender <{}> rejected: {}", addr, e);
            return self.reply_error(&e, 502).await;
        }

        info!("MAIL FROM: <{}>", addr);
        self.transaction.sender = Some(addr);
        self.state = SmtpState::HasSender;
        self.conn.reply(250, "OK").await
    }

    async fn handle_rcpt(&mut self, addr: String) -> Result<()> {
        if !matches!(self.state, SmtpState::HasSender | SmtpState::HasRecipient) {
            return self.conn.reply(503, "Need MAIL command first").await;
        }

        if let Err(e) = self.ctx.handler.check_recipient(&self.peer, &addr).await {
            warn!("Recipient <{}> rejected: {}", addr, e);
            return self.reply_error(&e, 502).await;
        }

        info!("RCPT TO: <{}>", addr);
        self.transaction.recipients.push(addr);
        self.state = SmtpState::HasRecipient;
        self.conn.reply(250, "OK").await
    }

    async fn handle_data(&mut self) -> Result<()> {
        if self.state != SmtpState::HasRecipient {
            return self.conn.reply(503, "Need RCPT command first").await;
        }

        self.conn
            .reply(354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let within_limit = self.receive_data().await?;

        let outcome = if within_limit {
            info!("End of DATA received, total size: {} bytes", self.transaction.data.len());
            let envelope = self.transaction.take_envelope();
            self.ctx.handler.deliver(&self.peer, envelope).await
        } else {
            let message = format!(
                "Message exceeded max message size of {} bytes",
                self.ctx.max_message_size
            );
            Err(PolicyError::new(552, message))
        };

        self.transaction.reset();
        self.state = SmtpState::Ready;

        match outcome {
            Ok(()) => self.conn.reply(250, "OK: Message accepted").await,
            Err(e) => {
                warn!("Message not accepted: {}", e);
                self.reply_error(&e, 502).await
            }
        }
    }

    /// Collect the message body up to the lone "." line
    ///
    /// Returns false if the body outgrew the size limit; the rest of it is
    /// read and dropped so the connection stays in sync.
    async fn receive_data(&mut self) -> Result<bool> {
        let max = self.ctx.max_message_size;
        let mut at_line_start = true;
        let mut overflow = false;

        loop {
            let chunk = self
                .conn
                .read_chunk(DATA_CHUNK_SIZE)
                .await?
                .ok_or(SmtpdError::ConnectionClosed)?;
            self.conn.extend_read_deadline();

            let line_start = at_line_start;
            at_line_start = chunk.ends_with(b"\n");

            if line_start && at_line_start && trim_line_ending(&chunk) == b"." {
                return Ok(!overflow);
            }

            if overflow {
                continue;
            }

            // Transparency: drop one leading dot (RFC 5321 4.5.2)
            let content = if line_start && chunk.starts_with(b".") {
                &chunk[1..]
            } else {
                &chunk[..]
            };

            if self.transaction.data.len() + content.len() > max {
                warn!("Message too large (max {} bytes)", max);
                overflow = true;
                self.transaction.data.clear();
                continue;
            }

            self.transaction.data.extend_from_slice(content);
        }
    }

    async fn handle_starttls(&mut self) -> Result<()> {
        let Some(acceptor) = self.ctx.tls_acceptor.clone() else {
            return self.conn.reply(502, "TLS not supported").await;
        };

        if self.conn.is_encrypted() {
            return self.conn.reply(503, "Already running in TLS").await;
        }

        info!("STARTTLS: Initiating TLS upgrade");
        self.conn.reply(220, "Ready to start TLS").await?;
        self.conn.upgrade(&acceptor).await?;

        // Everything negotiated in plaintext is void; the client must EHLO again
        self.peer.helo_name.clear();
        self.transaction.reset();
        self.state = SmtpState::Greeted;

        info!("STARTTLS: TLS upgrade completed successfully");
        Ok(())
    }

    async fn handle_auth(&mut self, mechanism: &str, initial_response: Option<String>) -> Result<()> {
        if !self.conn.is_encrypted() || !self.ctx.handler.supports_auth() {
            return self.conn.reply(503, "AUTH requires an active TLS session").await;
        }

        if self.authenticated {
            return self.conn.reply(503, "Already authenticated").await;
        }

        if self.state != SmtpState::Ready {
            return self.conn.reply(503, "AUTH not permitted during a mail transaction").await;
        }

        let Some(mechanism) = AuthMechanism::parse(mechanism) else {
            return self
                .conn
                .reply(504, "Unrecognized authentication type")
                .await;
        };

        info!("AUTH {} initiated", mechanism.as_str());

        let credentials = match self.read_credentials(mechanism, initial_response).await? {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("AUTH {} aborted: {}", mechanism.as_str(), e);
                return self.conn.reply(501, &e.to_string()).await;
            }
        };

        let verdict = self
            .ctx
            .handler
            .authenticate(&self.peer, &credentials.username, &credentials.password)
            .await;

        match verdict {
            Ok(()) => {
                info!("Authentication successful for {}", credentials.username);
                self.peer.username = credentials.username;
                self.peer.password = credentials.password;
                self.authenticated = true;
                self.conn.reply(235, "Authentication successful").await
            }
            Err(e) => {
                warn!("Authentication failed for {}", credentials.username);
                self.reply_error(&e, 535).await
            }
        }
    }

    /// Run the PLAIN or LOGIN exchange; the inner error means a malformed
    /// client response
    async fn read_credentials(
        &mut self,
        mechanism: AuthMechanism,
        initial_response: Option<String>,
    ) -> Result<std::result::Result<Credentials, AuthError>> {
        match mechanism {
            AuthMechanism::Plain => {
                let data = match initial_response {
                    Some(data) => data,
                    None => {
                        self.conn.reply(334, "").await?;
                        self.read_auth_line().await?
                    }
                };
                Ok(auth::decode_plain(&data))
            }
            AuthMechanism::Login => {
                let encoded_username = match initial_response {
                    Some(data) => data,
                    None => {
                        self.conn.reply(334, auth::USERNAME_CHALLENGE).await?;
                        self.read_auth_line().await?
                    }
                };
                let username = match auth::decode_login_credential(&encoded_username) {
                    Ok(username) => username,
                    Err(e) => return Ok(Err(e)),
                };

                self.conn.reply(334, auth::PASSWORD_CHALLENGE).await?;
                let encoded_password = self.read_auth_line().await?;

                Ok(auth::decode_login_credential(&encoded_password)
                    .map(|password| Credentials { username, password }))
            }
        }
    }

    async fn read_auth_line(&mut self) -> Result<String> {
        self.conn
            .read_line()
            .await?
            .ok_or(SmtpdError::ConnectionClosed)
    }

    async fn reply_error(&mut self, err: &PolicyError, default_code: u16) -> Result<()> {
        let (code, message) = err.reply(default_code);
        self.conn.reply(code, message).await
    }
}
