//! Listener address parsing and accept loop.
//!
//! The bind address decides the transport: a numeric value is a loopback
//! TCP port, a value with a colon is a TCP `host:port`, anything else is a
//! filesystem socket path.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::apps::AppTable;
use crate::connection;

/// A parsed listener endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP `host:port`.
    Tcp(String),
    /// Filesystem socket path.
    Unix(PathBuf),
}

impl ListenAddr {
    /// Parse a bind address string.
    ///
    /// `"8080"` becomes `127.0.0.1:8080`; `"1.2.3.4:9000"` stays TCP;
    /// `"/tmp/x.sock"` is a socket path.
    #[must_use]
    pub fn parse(addr: &str) -> Self {
        if !addr.is_empty() && addr.bytes().all(|b| b.is_ascii_digit()) {
            return Self::Tcp(format!("127.0.0.1:{addr}"));
        }
        if addr.contains(':') {
            return Self::Tcp(addr.to_string());
        }
        Self::Unix(PathBuf::from(addr))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A bound listener over either transport.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix socket listener; the path is kept for cleanup.
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Bind to `addr`. A stale socket file left by a previous daemon is
    /// removed first; the pid-file interlock guarantees it is not live.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when binding fails.
    pub async fn bind(addr: &ListenAddr) -> std::io::Result<Self> {
        match addr {
            ListenAddr::Tcp(spec) => Ok(Self::Tcp(TcpListener::bind(spec).await?)),
            ListenAddr::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Ok(Self::Unix(UnixListener::bind(path)?, path.clone()))
            }
        }
    }

    /// Accept one connection.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the accept fails.
    pub async fn accept(&self) -> std::io::Result<ClientStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ClientStream::Tcp(stream))
            }
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(ClientStream::Unix(stream))
            }
        }
    }

    /// Remove the socket file, if any. Best-effort.
    pub fn cleanup(&self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// An accepted connection over either transport.
#[derive(Debug)]
pub enum ClientStream {
    /// TCP stream.
    Tcp(TcpStream),
    /// Unix socket stream.
    Unix(UnixStream),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Accept connections until shutdown, spawning one task per connection.
pub async fn run(listener: Listener, table: std::sync::Arc<AppTable>) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok(stream) => {
                    let table = std::sync::Arc::clone(&table);
                    tokio::spawn(async move {
                        if let Err(e) = connection::serve(stream, table).await {
                            // Connection-local failure; the daemon keeps serving.
                            debug!("connection closed: {e}");
                        }
                    });
                }
                Err(e) => error!("failed to accept connection: {e}"),
            },
            () = table.state().wait_shutdown() => {
                info!("listener shutting down");
                break;
            }
        }
    }
    listener.cleanup();
}
