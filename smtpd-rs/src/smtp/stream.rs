//! Line framing and replies over a plain or TLS-upgraded connection

use crate::error::{Result, SmtpdError};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Maximum length of a command line, terminator included
pub const MAX_LINE_LENGTH: usize = 1000;

/// Unified stream type for both plain and TLS connections
///
/// Lets the session switch to TLS mid-connection on STARTTLS without
/// changing the type it reads from and writes to.
pub(crate) enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Placeholder while the handshake owns the socket
    Upgrading,
}

fn upgrading_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "I/O attempted during STARTTLS upgrade",
    )
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

/// Format a reply; every line but the last gets `<code>-`
pub fn format_reply(code: u16, lines: &[&str]) -> String {
    let mut reply = String::new();
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        let separator = if i == last { ' ' } else { '-' };
        reply.push_str(&format!("{}{}{}\r\n", code, separator, line));
    }
    if lines.is_empty() {
        reply.push_str(&format!("{} \r\n", code));
    }
    reply
}

/// Strip a trailing LF and an optional CR before it
pub fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Framer and responder for one connection
///
/// The read deadline is pushed forward every time a reply is flushed, so a
/// client is disconnected after `read_timeout` of silence following the
/// server's last reply.
pub(crate) struct Connection {
    reader: BufReader<SmtpStream>,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(SmtpStream::Plain(stream)),
            read_timeout,
            write_timeout,
            read_deadline: Instant::now() + read_timeout,
        }
    }

    /// Read up to `limit` bytes ending at the next LF
    ///
    /// The returned chunk keeps its terminator. A chunk without one either
    /// hit `limit` or is the tail of the stream. `None` means EOF.
    pub async fn read_chunk(&mut self, limit: usize) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let mut bounded = (&mut self.reader).take(limit as u64);

        let n = timeout_at(self.read_deadline, bounded.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| SmtpdError::Timeout)??;

        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    /// Push the read deadline forward without replying
    pub fn extend_read_deadline(&mut self) {
        self.read_deadline = Instant::now() + self.read_timeout;
    }

    /// Read one command line without its terminator
    ///
    /// An over-long line is consumed up to its end and reported as
    /// [`SmtpdError::LineTooLong`] so the session can answer and carry on.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let Some(chunk) = self.read_chunk(MAX_LINE_LENGTH).await? else {
            return Ok(None);
        };

        if chunk.len() == MAX_LINE_LENGTH && !chunk.ends_with(b"\n") {
            self.discard_line().await?;
            return Err(SmtpdError::LineTooLong {
                max: MAX_LINE_LENGTH,
            });
        }

        Ok(Some(String::from_utf8_lossy(trim_line_ending(&chunk)).into_owned()))
    }

    async fn discard_line(&mut self) -> Result<()> {
        loop {
            match self.read_chunk(MAX_LINE_LENGTH).await? {
                Some(chunk) if chunk.ends_with(b"\n") => return Ok(()),
                Some(_) => continue,
                None => return Err(SmtpdError::ConnectionClosed),
            }
        }
    }

    /// Send a single-line reply
    pub async fn reply(&mut self, code: u16, message: &str) -> Result<()> {
        self.send(&format_reply(code, &[message])).await
    }

    /// Send a multi-line reply
    pub async fn reply_lines(&mut self, code: u16, lines: &[&str]) -> Result<()> {
        self.send(&format_reply(code, lines)).await
    }

    async fn send(&mut self, reply: &str) -> Result<()> {
        debug!("Sending: {}", reply.trim_end());

        let stream = self.reader.get_mut();
        timeout(self.write_timeout, async {
            stream.write_all(reply.as_bytes()).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| SmtpdError::Timeout)??;

        self.read_deadline = Instant::now() + self.read_timeout;
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.reader.get_ref(), SmtpStream::Tls(_))
    }

    /// Run the TLS handshake on the underlying socket and rebuild the framer
    ///
    /// Bytes the client sent after STARTTLS but before the handshake are
    /// discarded with the old buffer.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let pending = self.reader.buffer().len();
        if pending > 0 {
            warn!("Discarding {} bytes pipelined after STARTTLS", pending);
        }

        let old = std::mem::replace(&mut self.reader, BufReader::new(SmtpStream::Upgrading));
        let tcp = match old.into_inner() {
            SmtpStream::Plain(tcp) => tcp,
            SmtpStream::Tls(_) | SmtpStream::Upgrading => {
                return Err(SmtpdError::Tls("Connection is not plaintext".to_string()));
            }
        };

        let tls = timeout_at(self.read_deadline, acceptor.accept(tcp))
            .await
            .map_err(|_| SmtpdError::Timeout)?
            .map_err(|e| SmtpdError::Tls(format!("TLS handshake failed: {}", e)))?;

        self.reader = BufReader::new(SmtpStream::Tls(Box::new(tls)));
        self.read_deadline = Instant::now() + self.read_timeout;
        Ok(())
    }

    /// Best-effort flush and shutdown
    pub async fn close(&mut self) {
        let stream = self.reader.get_mut();
        let closed = timeout(self.write_timeout, async {
            if let Err(e) = stream.flush().await {
                debug!("Flush before close failed: {}", e);
            }
            stream.shutdown().await
        })
        .await;

        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown failed: {}", e),
            Err(_) => debug!("Shutdown timed out"),
        }
    }
}
