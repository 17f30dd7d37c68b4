//! Cache-server client: one connection, three wire protocols.
//!
//! A [`Client`] owns exactly one buffered connection (TCP or unix domain
//! socket, created lazily on first use) and speaks the classic text protocol
//! ([`text`]), the compact meta text protocol ([`meta`]), and the
//! length-framed binary protocol ([`binary`]) over it. Clients are never
//! shared: each load worker drives its own.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::error::{McError, Result};

pub mod binary;
pub mod meta;
pub mod text;

pub use binary::{BinStatus, Item};
pub use meta::MetaResponse;

/// Hard protocol limit on key length, enforced before any bytes are written.
pub const KEY_MAX_LEN: usize = 250;

/// Outcome codes shared by all three protocol variants.
///
/// The two-letter variants mirror the meta protocol's response codes; the
/// spelled-out variants are the classic text protocol's responses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RespCode {
    /// Response could not be classified; inspect the accompanying error.
    #[default]
    CheckError,
    Va,
    Ok,
    En,
    Me,
    Hd,
    Ns,
    Ex,
    Nf,
    Mn,
    Se,
    Er,
    Cl,
    Hit,
    Miss,
    Stored,
    NotStored,
    ServerError,
    Deleted,
    NotFound,
    Error,
}

/// Parse a decimal prefix from `part`, returning the value and the index of
/// the first non-digit byte (0 when every byte was a digit). Server numerics
/// are trusted to be sane; there is no overflow handling.
pub(crate) fn parse_uint(part: &[u8]) -> (u64, usize) {
    let mut n = 0u64;
    for (i, &b) in part.iter().enumerate() {
        if !b.is_ascii_digit() {
            return (n, i);
        }
        n = n * 10 + u64::from(b - b'0');
    }
    (n, 0)
}

/// Where the server lives.
#[derive(Debug, Clone)]
pub enum ServerTarget {
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

/// Connection tuning. Timeouts surface as `io::ErrorKind::TimedOut`, which
/// is fatal to the worker owning the connection.
#[derive(Debug, Clone)]
pub struct ConnOptions {
    pub connect_timeout: Duration,
    /// Deadline applied independently to each read and write.
    pub net_timeout: Duration,
    pub rbuf_size: usize,
    pub wbuf_size: usize,
}

impl Default for ConnOptions {
    fn default() -> Self {
        ConnOptions {
            connect_timeout: Duration::from_secs(3),
            net_timeout: Duration::from_secs(1),
            rbuf_size: 128 * 1024,
            wbuf_size: 64 * 1024,
        }
    }
}

enum NetStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One buffered stream to the server. Owned exclusively by one client; torn
/// down only when the client is dropped or a fatal I/O error occurs (there
/// is no reconnect logic).
pub struct Connection {
    io: BufStream<NetStream>,
    net_timeout: Duration,
}

fn timed_out(what: &'static str) -> McError {
    McError::Io(io::Error::new(io::ErrorKind::TimedOut, what))
}

impl Connection {
    async fn connect(target: &ServerTarget, opts: &ConnOptions) -> Result<Connection> {
        let stream = match target {
            ServerTarget::Tcp(addr) => {
                let stream = timeout(opts.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| timed_out("connect timed out"))??;
                stream.set_nodelay(true)?;
                NetStream::Tcp(stream)
            }
            #[cfg(unix)]
            ServerTarget::Unix(path) => {
                let stream = timeout(opts.connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| timed_out("connect timed out"))??;
                NetStream::Unix(stream)
            }
        };
        Ok(Connection {
            io: BufStream::with_capacity(opts.rbuf_size, opts.wbuf_size, stream),
            net_timeout: opts.net_timeout,
        })
    }

    /// Read one line including its `\n` terminator into `line` (cleared
    /// first). An empty read means the server closed the connection.
    pub(crate) async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<()> {
        line.clear();
        let n = timeout(self.net_timeout, self.io.read_until(b'\n', line))
            .await
            .map_err(|_| timed_out("read timed out"))??;
        if n == 0 {
            return Err(McError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Ok(())
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        timeout(self.net_timeout, self.io.read_exact(buf))
            .await
            .map_err(|_| timed_out("read timed out"))??;
        Ok(())
    }

    /// Queue bytes onto the write buffer. Nothing reaches the wire until
    /// [`Connection::flush`] (or the buffer overflows and drains itself).
    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        timeout(self.net_timeout, self.io.write_all(buf))
            .await
            .map_err(|_| timed_out("write timed out"))??;
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        timeout(self.net_timeout, self.io.flush())
            .await
            .map_err(|_| timed_out("write timed out"))??;
        Ok(())
    }
}

/// A cache-server client bound to one connection.
pub struct Client {
    target: ServerTarget,
    pub opts: ConnOptions,
    conn: Option<Connection>,
    /// Writes queued since the last flush; receive paths auto-flush when set.
    pending_writes: bool,
    pipelines: u32,
    key_prefix: String,
    strip_key_prefix: bool,
    opaque: u32,
    pkt: binary::Packet,
}

impl Client {
    /// Build a client for `host` (or, when given, the unix socket `socket`).
    /// The connection itself is established on the first request.
    pub fn new(
        host: &str,
        socket: Option<&str>,
        pipelines: u32,
        key_prefix: &str,
        strip_key_prefix: bool,
    ) -> Result<Client> {
        let target = match socket {
            #[cfg(unix)]
            Some(path) if !path.is_empty() => ServerTarget::Unix(PathBuf::from(path)),
            #[cfg(not(unix))]
            Some(path) if !path.is_empty() => {
                return Err(McError::Config(
                    "domain sockets are not supported on this platform".into(),
                ))
            }
            _ => ServerTarget::Tcp(host.to_string()),
        };
        Ok(Client {
            target,
            opts: ConnOptions::default(),
            conn: None,
            pending_writes: false,
            pipelines: pipelines.max(1),
            key_prefix: key_prefix.to_string(),
            strip_key_prefix,
            opaque: 0,
            pkt: binary::Packet::default(),
        })
    }

    pub fn set_pipelines(&mut self, pipelines: u32) {
        self.pipelines = pipelines.max(1);
    }

    /// Validate the key and make sure the connection exists. Every request
    /// path funnels through here so an oversized key fails before any bytes
    /// are written.
    pub(crate) async fn ready(&mut self, key: &str) -> Result<&mut Connection> {
        if key.len() > KEY_MAX_LEN {
            return Err(McError::KeyTooLong);
        }
        if self.conn.is_none() {
            self.conn = Some(Connection::connect(&self.target, &self.opts).await?);
        }
        Ok(self.conn.as_mut().expect("connection established above"))
    }

    pub(crate) fn connected(&mut self) -> Result<&mut Connection> {
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(McError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "no requests have been issued on this client",
            ))),
        }
    }
}
