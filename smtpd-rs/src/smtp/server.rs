use crate::config::SmtpConfig;
use crate::error::{Result, SmtpdError};
use crate::security::TlsConfig;
use crate::smtp::handler::{Handler, NoopHandler};
use crate::smtp::session::SmtpSession;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause before retrying after a transient accept failure
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Settings resolved once when serving starts and shared read-only by all sessions
pub(crate) struct ServerContext {
    pub hostname: String,
    pub banner: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_size: usize,
    pub max_connections: Option<usize>,
    pub force_tls: bool,
    pub handler: Arc<dyn Handler>,
    pub tls_acceptor: Option<TlsAcceptor>,
}

/// SMTP server accepting connections and running one session per client
///
/// # Example
/// ```no_run
/// use smtpd_rs::config::SmtpConfig;
/// use smtpd_rs::smtp::{NoopHandler, SmtpServer};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = SmtpServer::new(SmtpConfig::default()).with_handler(Arc::new(NoopHandler));
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct SmtpServer {
    config: SmtpConfig,
    handler: Arc<dyn Handler>,
    tls: Option<TlsConfig>,
}

impl SmtpServer {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            handler: Arc::new(NoopHandler),
            tls: None,
        }
    }

    /// Install the policy hooks and delivery callback
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    /// Enable STARTTLS
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    fn context(&self) -> Result<Arc<ServerContext>> {
        if self.config.force_tls && self.tls.is_none() {
            return Err(SmtpdError::Config(
                "force_tls requires TLS to be configured".to_string(),
            ));
        }

        let hostname = self.config.resolved_hostname();
        let banner = self.config.resolved_banner(&hostname);

        Ok(Arc::new(ServerContext {
            hostname,
            banner,
            read_timeout: self.config.read_timeout(),
            write_timeout: self.config.write_timeout(),
            max_message_size: self.config.message_size_limit(),
            max_connections: self.config.connection_limit(),
            force_tls: self.config.force_tls,
            handler: self.handler.clone(),
            tls_acceptor: self.tls.as_ref().map(TlsConfig::acceptor),
        }))
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until a non-transient accept error
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `signal` completes, then stop accepting and wait for
    /// in-flight sessions to finish
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ctx = self.context()?;
        if let Ok(addr) = listener.local_addr() {
            info!("SMTP server listening on {}", addr);
        }

        let limiter = ctx
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let tracker = TaskTracker::new();

        tokio::pin!(signal);

        let result = loop {
            let accepted = tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested, no longer accepting connections");
                    break Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, addr)) => {
                    info!("New SMTP connection from {}", addr);

                    let session = SmtpSession::new(ctx.clone(), socket, addr);
                    let limiter = limiter.clone();
                    let span = info_span!("smtp_session", peer = %addr);

                    tracker.spawn(
                        async move {
                            let _permit = match limiter {
                                Some(limiter) => match limiter.try_acquire_owned() {
                                    Ok(permit) => Some(permit),
                                    Err(_) => {
                                        warn!("Connection limit reached, rejecting");
                                        session.reject_busy().await;
                                        return;
                                    }
                                },
                                None => None,
                            };

                            match session.handle().await {
                                Ok(()) => debug!("Session closed"),
                                Err(e) => error!("Session error: {}", e),
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) if is_transient(&e) => {
                    warn!("Transient accept error: {}; retrying in {:?}", e, ACCEPT_BACKOFF);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    break Err(e.into());
                }
            }
        };

        tracker.close();
        if !tracker.is_empty() {
            info!("Waiting for {} session(s) to finish", tracker.len());
        }
        tracker.wait().await;

        result
    }
}

/// Accept errors worth retrying: per-connection failures and descriptor exhaustion
fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        // ENFILE, EMFILE
        _ => matches!(err.raw_os_error(), Some(23) | Some(24)),
    }
}
