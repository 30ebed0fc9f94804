//! Security module
//!
//! - [`auth`]: SMTP AUTH credential decoding (LOGIN, PLAIN)
//! - [`tls`]: TLS material for STARTTLS

pub mod auth;
pub mod tls;

pub use auth::{AuthError, AuthMechanism, Credentials};
pub use tls::TlsConfig;
