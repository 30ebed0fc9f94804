//! smtpd-rs: embeddable SMTP server core
//!
//! Accepts mail over SMTP and hands every decision to the application
//! through a [`Handler`](smtp::Handler): whether to talk to a client, which
//! senders and recipients to accept, whose credentials are valid and what
//! to do with a finished message.
//!
//! # Features
//!
//! - **STARTTLS**: in-place upgrade of a plaintext session
//! - **AUTH**: PLAIN and LOGIN, offered only over TLS
//! - **Limits**: connection cap, message size, command line length
//! - **Timeouts**: sliding read and write deadlines against stalled clients
//!
//! # Example
//!
//! ```no_run
//! use smtpd_rs::config::Config;
//! use smtpd_rs::smtp::{NoopHandler, SmtpServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let server = SmtpServer::new(config.smtp).with_handler(Arc::new(NoopHandler));
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod security;
pub mod smtp;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, SmtpdError};
