use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timed out waiting for client")]
    Timeout,

    #[error("Line too long (max {max} bytes)")]
    LineTooLong { max: usize },

    #[error("Connection closed by client")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, SmtpdError>;
