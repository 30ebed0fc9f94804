//! SMTP server core (RFC 5321)
//!
//! - [`server`]: listener, admission limit and graceful shutdown
//! - [`handler`]: policy hooks and delivery callback
//! - [`commands`]: command line parsing
//! - [`envelope`]: peer and message types handed to the hooks
//! - [`stream`]: line framing, replies and the STARTTLS upgrade

pub mod commands;
pub mod envelope;
pub mod handler;
pub mod server;
mod session;
pub mod stream;

pub use commands::SmtpCommand;
pub use envelope::{Envelope, Peer};
pub use handler::{Handler, NoopHandler, PolicyError};
pub use server::SmtpServer;
