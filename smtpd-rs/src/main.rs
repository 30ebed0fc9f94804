//! smtpd-rs: standalone SMTP receiver
//!
//! Accepts mail with the configured limits, checks AUTH against the static
//! users from the config file and logs every delivered message.

use anyhow::Context;
use clap::Parser;
use smtpd_rs::config::{Config, LoggingConfig, TlsSettings};
use smtpd_rs::security::TlsConfig;
use smtpd_rs::smtp::{Envelope, Handler, Peer, PolicyError, SmtpServer};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "smtpd-rs", version, about = "Embeddable SMTP server")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen address from the config file
    #[arg(short, long)]
    listen: Option<String>,
}

/// Accepts everything, authenticates against a fixed user table and logs deliveries
struct LoggingHandler {
    users: HashMap<String, String>,
}

#[async_trait::async_trait]
impl Handler for LoggingHandler {
    fn supports_auth(&self) -> bool {
        !self.users.is_empty()
    }

    async fn authenticate(
        &self,
        _peer: &Peer,
        username: &str,
        password: &str,
    ) -> Result<(), PolicyError> {
        match self.users.get(username) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(PolicyError::new(535, "Authentication credentials invalid")),
        }
    }

    async fn deliver(&self, peer: &Peer, envelope: Envelope) -> Result<(), PolicyError> {
        info!(
            peer = %peer.addr,
            helo = %peer.helo_name,
            user = %peer.username,
            "Received {} bytes from <{}> for {:?}",
            envelope.data.len(),
            envelope.sender,
            envelope.recipients
        );
        Ok(())
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("smtpd_rs={}", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_tls(settings: &TlsSettings, hostname: &str) -> anyhow::Result<TlsConfig> {
    match (&settings.cert_path, &settings.key_path) {
        (Some(cert), Some(key)) => {
            info!("Loading TLS certificate from {}", cert);
            Ok(TlsConfig::from_pem_files(cert, key)?)
        }
        _ if settings.self_signed => {
            warn!("Using a self-signed certificate for {}", hostname);
            Ok(TlsConfig::self_signed(hostname)?)
        }
        _ => anyhow::bail!("[tls] needs cert_path and key_path, or self_signed = true"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        Config::default()
    };
    if let Some(listen) = args.listen {
        config.smtp.listen_addr = listen;
    }

    init_logging(&config.logging);
    info!("Starting smtpd-rs v{}", env!("CARGO_PKG_VERSION"));
    if !args.config.exists() {
        info!("No config file at {}, using defaults", args.config.display());
    }

    let handler = Arc::new(LoggingHandler {
        users: config.auth.users.clone(),
    });
    let mut server = SmtpServer::new(config.smtp.clone()).with_handler(handler);

    if let Some(settings) = &config.tls {
        let hostname = config.smtp.resolved_hostname();
        server = server.with_tls(load_tls(settings, &hostname)?);
    }

    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  Max message size: {} bytes", config.smtp.message_size_limit());
    match config.smtp.connection_limit() {
        Some(limit) => info!("  Max connections: {}", limit),
        None => info!("  Max connections: unlimited"),
    }

    let listener = tokio::net::TcpListener::bind(&config.smtp.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.smtp.listen_addr))?;

    server
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("smtpd-rs stopped");
    Ok(())
}
