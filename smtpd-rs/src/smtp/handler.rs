//! Policy hooks and delivery callback
//!
//! A [`Handler`] decides whether a session may proceed at each stage and
//! receives every completed message. All methods have a default that
//! accepts, so an implementation only overrides the stages it cares about.
//!
//! # Example
//! ```
//! use smtpd_rs::smtp::{Envelope, Handler, Peer, PolicyError};
//!
//! struct OnlyExampleOrg;
//!
//! #[async_trait::async_trait]
//! impl Handler for OnlyExampleOrg {
//!     async fn check_recipient(&self, _peer: &Peer, addr: &str) -> Result<(), PolicyError> {
//!         if addr.ends_with("@example.org") {
//!             Ok(())
//!         } else {
//!             Err(PolicyError::new(550, "No such user"))
//!         }
//!     }
//!
//!     async fn deliver(&self, _peer: &Peer, envelope: Envelope) -> Result<(), PolicyError> {
//!         println!("{} bytes from {}", envelope.data.len(), envelope.sender);
//!         Ok(())
//!     }
//! }
//! ```

use super::envelope::{Envelope, Peer};
use thiserror::Error;

/// A verdict returned by a hook
///
/// With a code the reply is sent verbatim as `<code> <message>`. Without one
/// the session picks the default code for the stage that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PolicyError {
    pub code: Option<u16>,
    pub message: String,
}

impl PolicyError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// An error without a reply code of its own
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Reply code and text for this error, using `default_code` when uncoded
    pub fn reply(&self, default_code: u16) -> (u16, &str) {
        (self.code.unwrap_or(default_code), &self.message)
    }
}

impl From<std::io::Error> for PolicyError {
    fn from(err: std::io::Error) -> Self {
        Self::other(err.to_string())
    }
}

impl From<anyhow::Error> for PolicyError {
    fn from(err: anyhow::Error) -> Self {
        Self::other(err.to_string())
    }
}

#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Called once per connection, before the greeting
    async fn check_connection(&self, _peer: &Peer) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Called after each HELO/EHLO; `peer.helo_name` holds the new name
    async fn check_helo(&self, _peer: &Peer) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Called after MAIL FROM
    async fn check_sender(&self, _peer: &Peer, _addr: &str) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Called after each RCPT TO
    async fn check_recipient(&self, _peer: &Peer, _addr: &str) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Whether AUTH is offered (once TLS is active)
    fn supports_auth(&self) -> bool {
        false
    }

    /// Verify decoded credentials; only called when [`supports_auth`](Self::supports_auth) is true
    async fn authenticate(
        &self,
        _peer: &Peer,
        _username: &str,
        _password: &str,
    ) -> Result<(), PolicyError> {
        Err(PolicyError::new(535, "Authentication not supported"))
    }

    /// Called once per completed DATA
    async fn deliver(&self, _peer: &Peer, _envelope: Envelope) -> Result<(), PolicyError> {
        Ok(())
    }
}

/// Accepts every connection, address and message and discards the mail
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {}
