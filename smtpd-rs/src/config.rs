use crate::error::{Result, SmtpdError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:10025";

/// Default read/write timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default maximum message size in bytes
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10_240_000;

/// Default maximum number of concurrent connections
pub const DEFAULT_MAX_CONNECTIONS: i64 = 100;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub tls: Option<TlsSettings>,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub listen_addr: String,
    /// Name used in replies; falls back to the machine hostname
    pub hostname: Option<String>,
    /// Greeting text; falls back to "<hostname> ESMTP ready."
    pub banner: Option<String>,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub max_message_size: usize,
    /// Zero or negative disables the limit
    pub max_connections: i64,
    pub force_tls: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsSettings {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    #[serde(default)]
    pub self_signed: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// username -> password
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            hostname: None,
            banner: None,
            read_timeout_secs: DEFAULT_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            force_tls: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SmtpdError::Config(e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SmtpdError::Config(e.to_string()))
    }
}

impl SmtpConfig {
    pub fn read_timeout(&self) -> Duration {
        non_zero_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        non_zero_secs(self.write_timeout_secs)
    }

    pub fn message_size_limit(&self) -> usize {
        if self.max_message_size == 0 {
            DEFAULT_MAX_MESSAGE_SIZE
        } else {
            self.max_message_size
        }
    }

    /// `None` means connections are not limited
    ///
    /// Capped at the most permits a tokio semaphore can hold.
    pub fn connection_limit(&self) -> Option<usize> {
        usize::try_from(self.max_connections)
            .ok()
            .filter(|limit| *limit > 0)
            .map(|limit| limit.min(Semaphore::MAX_PERMITS))
    }

    pub fn resolved_hostname(&self) -> String {
        match &self.hostname {
            Some(hostname) if !hostname.is_empty() => hostname.clone(),
            _ => gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    pub fn resolved_banner(&self, hostname: &str) -> String {
        match &self.banner {
            Some(banner) if !banner.is_empty() => banner.clone(),
            _ => format!("{} ESMTP ready.", hostname),
        }
    }
}

fn non_zero_secs(secs: u64) -> Duration {
    if secs == 0 {
        Duration::from_secs(DEFAULT_TIMEOUT_SECS)
    } else {
        Duration::from_secs(secs)
    }
}
