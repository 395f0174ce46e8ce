//! Listener provisioning with backpressure.
//!
//! # Responsibilities
//! - Resolve a bind target (`host:port` or `unix://path`) into a live listener
//! - Read back the resolved address (ephemeral ports)
//! - Enforce max_connections limit via semaphore
//! - Remove stale unix socket files before binding and after closing

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::Semaphore;

/// Any bidirectional byte stream a connection can be served over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased connection stream (plain TCP, unix socket, or TLS).
pub type BoxedIo = Box<dyn Io>;

const UNIX_SCHEME: &str = "unix://";

/// Where the runtime listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    /// `host:port`; an empty host binds all interfaces.
    Tcp(String),
    /// Filesystem socket path.
    Unix(PathBuf),
}

/// Malformed bind target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bind target {target:?}: {reason}")]
pub struct BindTargetError {
    pub target: String,
    pub reason: &'static str,
}

impl FromStr for BindTarget {
    type Err = BindTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| BindTargetError {
            target: s.to_string(),
            reason,
        };

        if let Some(path) = s.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(err("missing socket path"));
            }
            return Ok(BindTarget::Unix(PathBuf::from(path)));
        }

        let (host, port) = s.rsplit_once(':').ok_or_else(|| err("expected host:port"))?;
        port.parse::<u16>().map_err(|_| err("invalid port"))?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Ok(BindTarget::Tcp(format!("{}:{}", host, port)))
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Tcp(addr) => f.write_str(addr),
            BindTarget::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
        }
    }
}

/// Address a listener actually bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl LocalAddr {
    /// The socket address, for TCP listeners.
    pub fn tcp(&self) -> Option<SocketAddr> {
        match self {
            LocalAddr::Tcp(addr) => Some(*addr),
            LocalAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalAddr::Tcp(addr) => write!(f, "{}", addr),
            LocalAddr::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
        }
    }
}

/// Remote end of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
}

impl PeerAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerAddr::Tcp(addr) => Some(*addr),
            PeerAddr::Unix => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Unix => f.write_str("unix"),
        }
    }
}

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Bind target could not be parsed.
    Target(BindTargetError),
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Failed to accept connection.
    Accept(std::io::Error),
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Target(e) => write!(f, "{}", e),
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Target(e) => Some(e),
            ListenerError::Bind(e) | ListenerError::Accept(e) => Some(e),
        }
    }
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bounded listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    inner: Inner,
    local_addr: LocalAddr,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
}

impl Listener {
    /// Bind to the target with connection limits. Bind errors are returned
    /// as-is; there is no retry.
    pub async fn bind(target: &BindTarget, max_connections: usize) -> Result<Self, ListenerError> {
        let (inner, local_addr) = match target {
            BindTarget::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .map_err(ListenerError::Bind)?;
                let local = listener.local_addr().map_err(ListenerError::Bind)?;
                (Inner::Tcp(listener), LocalAddr::Tcp(local))
            }
            #[cfg(unix)]
            BindTarget::Unix(path) => {
                remove_stale_socket(path).map_err(ListenerError::Bind)?;
                let listener = UnixListener::bind(path).map_err(ListenerError::Bind)?;
                (Inner::Unix(listener), LocalAddr::Unix(path.clone()))
            }
            #[cfg(not(unix))]
            BindTarget::Unix(_) => {
                return Err(ListenerError::Bind(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                )));
            }
        };

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            local_addr,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(BoxedIo, PeerAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Accept(io::Error::other("connection limiter closed")))?;

        let (stream, peer): (BoxedIo, PeerAddr) = match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(ListenerError::Accept)?;
                // Not fatal: the connection still works without it.
                let _ = stream.set_nodelay(true);
                (Box::new(stream), PeerAddr::Tcp(addr))
            }
            #[cfg(unix)]
            Inner::Unix(listener) => {
                let (stream, _) = listener.accept().await.map_err(ListenerError::Accept)?;
                (Box::new(stream), PeerAddr::Unix)
            }
        };

        tracing::debug!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// Get the address this listener is bound to.
    pub fn local_addr(&self) -> &LocalAddr {
        &self.local_addr
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let LocalAddr::Unix(path) = &self.local_addr {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

/// A socket file nobody answers on is left over from a previous process.
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            match std::os::unix::net::UnixStream::connect(path) {
                Ok(_) => Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("socket {} is in use", path.display()),
                )),
                Err(_) => {
                    tracing::info!(path = %path.display(), "Removing stale socket file");
                    std::fs::remove_file(path)
                }
            }
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_targets() {
        assert_eq!(
            "127.0.0.1:9090".parse::<BindTarget>().unwrap(),
            BindTarget::Tcp("127.0.0.1:9090".into())
        );
        assert_eq!(
            ":0".parse::<BindTarget>().unwrap(),
            BindTarget::Tcp("0.0.0.0:0".into())
        );
        assert_eq!(
            "[::1]:80".parse::<BindTarget>().unwrap(),
            BindTarget::Tcp("[::1]:80".into())
        );
        assert!("localhost".parse::<BindTarget>().is_err());
        assert!("host:99999".parse::<BindTarget>().is_err());
    }

    #[test]
    fn parse_unix_targets() {
        assert_eq!(
            "unix:///tmp/svc.sock".parse::<BindTarget>().unwrap(),
            BindTarget::Unix(PathBuf::from("/tmp/svc.sock"))
        );
        assert!("unix://".parse::<BindTarget>().is_err());
    }

    #[tokio::test]
    async fn ephemeral_port_is_resolved() {
        let target: BindTarget = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(&target, 4).await.unwrap();
        let addr = listener.local_addr().tcp().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.max_connections(), 4);
    }

    #[tokio::test]
    async fn permits_follow_connections() {
        let target: BindTarget = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(&target, 2).await.unwrap();
        let addr = listener.local_addr().tcp().unwrap();

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_io, peer, permit) = listener.accept().await.unwrap();
        assert!(peer.socket_addr().is_some());
        assert_eq!(listener.available_permits(), 1);

        drop(permit);
        assert_eq!(listener.available_permits(), 2);
    }

    #[tokio::test]
    async fn bind_error_is_returned() {
        let target: BindTarget = "127.0.0.1:0".parse().unwrap();
        let first = Listener::bind(&target, 1).await.unwrap();
        let taken = BindTarget::Tcp(first.local_addr().to_string());
        let err = Listener::bind(&taken, 1).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind(ref e) if e.kind() == io::ErrorKind::AddrInUse));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_unix_socket_is_replaced() {
        let dir = std::env::temp_dir().join(format!("rpc-runtime-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("svc.sock");

        // Leave a socket file behind with nobody listening.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let target = BindTarget::Unix(path.clone());
        let listener = Listener::bind(&target, 1).await.unwrap();
        assert_eq!(listener.local_addr(), &LocalAddr::Unix(path.clone()));

        // A live socket is not stolen.
        let err = Listener::bind(&target, 1).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind(ref e) if e.kind() == io::ErrorKind::AddrInUse));

        drop(listener);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
