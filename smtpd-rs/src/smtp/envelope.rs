use std::net::SocketAddr;

/// The client on the other end of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Name given in HELO/EHLO, empty until greeted
    pub helo_name: String,
    /// Username from AUTH, empty until authenticated
    pub username: String,
    /// Password from AUTH, empty until authenticated
    pub password: String,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            helo_name: String::new(),
            username: String::new(),
            password: String::new(),
            addr,
        }
    }
}

/// A completed message as handed to [`Handler::deliver`](super::Handler::deliver)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    /// Raw message bytes after dot-unstuffing, terminators as received
    pub data: Vec<u8>,
}

/// Mail transaction being built between MAIL FROM and the end of DATA
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

impl Transaction {
    pub fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.data.clear();
    }

    /// Move the draft out as a delivered envelope, leaving it empty
    pub fn take_envelope(&mut self) -> Envelope {
        Envelope {
            sender: self.sender.take().unwrap_or_default(),
            recipients: std::mem::take(&mut self.recipients),
            data: std::mem::take(&mut self.data),
        }
    }
}
