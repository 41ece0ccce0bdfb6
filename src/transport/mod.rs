//! Byte-stream endpoints for the socket transports.
//!
//! Supports:
//! - TCP: host/port endpoints (`tcp` and `fieldbus` transports)
//! - UDS: Unix domain sockets in a shared directory (`ipc` transport)
//!
//! Streams are split into boxed read/write halves so the framing layer is
//! independent of the socket family.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::config::HostPort;
use crate::driver::TransportError;

/// Read half of a connected stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a connected stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Address a hub listens on and peers connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// TCP host and port.
    Tcp(HostPort),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(hp) => write!(f, "tcp://{}", hp.addr()),
        }
    }
}

/// A connected stream of either family.
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    /// Connect to an endpoint.
    pub async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
            Endpoint::Tcp(hp) => {
                let stream = TcpStream::connect(hp.addr()).await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
        }
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Stream::Unix(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            Stream::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

/// A bound listener.
pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind an endpoint.
    ///
    /// Fails with [`TransportError::AddressInUse`] if another live listener
    /// already owns it. For UDS the returned guard removes the socket file
    /// when dropped.
    pub async fn bind(
        endpoint: &Endpoint,
    ) -> Result<(Self, Option<UdsCleanupGuard>), TransportError> {
        let bound = match endpoint {
            Endpoint::Unix(path) => {
                let guard = prepare_uds_socket(path).await?;
                let listener = UnixListener::bind(path).map_err(|e| in_use(e, endpoint))?;
                (Listener::Unix(listener), Some(guard))
            }
            Endpoint::Tcp(hp) => {
                let listener = TcpListener::bind(hp.addr())
                    .await
                    .map_err(|e| in_use(e, endpoint))?;
                (Listener::Tcp(listener), None)
            }
        };

        info!(endpoint = %endpoint, "Listening");
        Ok(bound)
    }

    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
        }
    }
}

fn in_use(error: io::Error, endpoint: &Endpoint) -> TransportError {
    if error.kind() == io::ErrorKind::AddrInUse {
        TransportError::AddressInUse(endpoint.to_string())
    } else {
        TransportError::Io(error)
    }
}

/// RAII guard for cleaning up UDS socket files.
pub struct UdsCleanupGuard {
    path: PathBuf,
}

impl UdsCleanupGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UdsCleanupGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up UDS socket"
                );
            } else {
                debug!(path = %self.path.display(), "Cleaned up UDS socket");
            }
        }
    }
}

/// Prepare a UDS socket path for binding.
///
/// - Creates parent directories if needed
/// - Fails if a live listener answers on the path
/// - Removes a stale socket file left by a dead process
/// - Returns a cleanup guard that removes the socket on drop
pub async fn prepare_uds_socket(path: &Path) -> Result<UdsCleanupGuard, TransportError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(TransportError::AddressInUse(path.display().to_string()));
        }
        info!(path = %path.display(), "Removing stale UDS socket");
        std::fs::remove_file(path)?;
    }

    Ok(UdsCleanupGuard::new(path))
}
