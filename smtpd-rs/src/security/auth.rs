//! SMTP AUTH credential decoding
//!
//! # Supported mechanisms
//! - PLAIN (RFC 4616)
//! - LOGIN (common but not standardized)
//!
//! Decoding is separated from verification: the session decodes the
//! exchange here and hands the username/password to the configured
//! [`Handler`](crate::smtp::Handler).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// base64("Username:")
pub const USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";

/// base64("Password:")
pub const PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

/// Mechanisms advertised in the EHLO reply
pub const ADVERTISED_MECHANISMS: &str = "PLAIN LOGIN";

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    /// Parse mechanism from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    /// Get mechanism name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid UTF-8 in credentials")]
    InvalidUtf8,

    #[error("Invalid PLAIN auth format")]
    InvalidFormat,

    #[error("Authentication cancelled")]
    Cancelled,
}

/// Decoded username/password pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Decode PLAIN authentication data
///
/// Format: `authzid\0username\0password` (base64 encoded). The
/// authorization identity is ignored.
pub fn decode_plain(auth_data: &str) -> Result<Credentials, AuthError> {
    let decoded = decode_field(auth_data)?;

    let mut parts = decoded.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(username), Some(password), None) => Ok(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }),
        _ => Err(AuthError::InvalidFormat),
    }
}

/// Decode one LOGIN response line (username or password)
pub fn decode_login_credential(credential: &str) -> Result<String, AuthError> {
    decode_field(credential)
}

fn decode_field(field: &str) -> Result<String, AuthError> {
    let field = field.trim();
    if field == "*" {
        return Err(AuthError::Cancelled);
    }

    let decoded = BASE64
        .decode(field)
        .map_err(|_| AuthError::InvalidBase64)?;

    String::from_utf8(decoded).map_err(|_| AuthError::InvalidUtf8)
}
