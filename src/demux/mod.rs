//! Protocol demultiplexer.
//!
//! # Data Flow
//! ```text
//! Listener::accept
//!     → TLS handshake (optional, bounded by read timeout)
//!     → detect.rs sniff (bounded by read timeout; unclassified → drop)
//!     → VirtualListener "rpc"  (HTTP/2 preface)
//!     → VirtualListener "http" (everything else)
//!
//! Combined mode: handshake only, one VirtualListener carries every
//! connection and requests are told apart by content type downstream.
//! ```
//!
//! # Design Decisions
//! - Detection runs on a per-connection task so a slow client cannot stall
//!   the accept loop
//! - When the accept loop exits its senders drop, and every virtual listener
//!   reports `ServeError::ListenerClosed`, the benign shutdown sentinel

pub mod detect;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ServeError;
use crate::lifecycle::PhaseWatch;
use crate::net::listener::ConnectionPermit;
use crate::net::tls::{self, CertificateProvider};
use crate::net::{BoxedIo, Listener, ListenerError, LocalAddr, PeerAddr};
use crate::observability::metrics;

pub use detect::{classify, PrefixedIo, Protocol, H2_PREFACE};

const CHANNEL_CAPACITY: usize = 128;

/// A connection handed to a sub-server.
pub struct Accepted {
    pub io: BoxedIo,
    pub peer: PeerAddr,
    pub permit: ConnectionPermit,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted").field("peer", &self.peer).finish()
    }
}

/// One protocol's share of the physical listener.
#[derive(Debug)]
pub struct VirtualListener {
    name: &'static str,
    rx: mpsc::Receiver<Accepted>,
    local_addr: LocalAddr,
}

impl VirtualListener {
    /// Next connection. `ListenerClosed` once the demultiplexer has stopped.
    pub async fn accept(&mut self) -> Result<Accepted, ServeError> {
        self.rx.recv().await.ok_or(ServeError::ListenerClosed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn local_addr(&self) -> &LocalAddr {
        &self.local_addr
    }
}

#[derive(Clone)]
enum Routes {
    Split {
        rpc: mpsc::Sender<Accepted>,
        http: mpsc::Sender<Accepted>,
    },
    Combined(mpsc::Sender<Accepted>),
}

/// Owns the physical listener and feeds the virtual ones.
pub struct Demux {
    listener: Listener,
    tls: Option<Arc<dyn CertificateProvider>>,
    read_timeout: Duration,
    routes: Routes,
}

impl Demux {
    /// Split `listener` into an RPC and an HTTP virtual listener.
    pub fn split(
        listener: Listener,
        tls: Option<Arc<dyn CertificateProvider>>,
        read_timeout: Duration,
    ) -> (Self, VirtualListener, VirtualListener) {
        let (rpc_tx, rpc_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (http_tx, http_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let local_addr = listener.local_addr().clone();

        let demux = Self {
            listener,
            tls,
            read_timeout,
            routes: Routes::Split {
                rpc: rpc_tx,
                http: http_tx,
            },
        };
        let rpc = VirtualListener {
            name: "rpc",
            rx: rpc_rx,
            local_addr: local_addr.clone(),
        };
        let http = VirtualListener {
            name: "http",
            rx: http_rx,
            local_addr,
        };
        (demux, rpc, http)
    }

    /// Forward every connection to a single virtual listener.
    pub fn combined(
        listener: Listener,
        tls: Option<Arc<dyn CertificateProvider>>,
        read_timeout: Duration,
    ) -> (Self, VirtualListener) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let local_addr = listener.local_addr().clone();

        let demux = Self {
            listener,
            tls,
            read_timeout,
            routes: Routes::Combined(tx),
        };
        let combined = VirtualListener {
            name: "combined",
            rx,
            local_addr,
        };
        (demux, combined)
    }

    pub fn local_addr(&self) -> &LocalAddr {
        self.listener.local_addr()
    }

    /// Accept until `stop` fires, draining begins, or accept fails.
    ///
    /// Dropping the listener on exit stops new connections at the socket.
    pub async fn run(self, stop: CancellationToken, phase: PhaseWatch) -> Result<(), ServeError> {
        let Demux {
            listener,
            tls,
            read_timeout,
            routes,
        } = self;

        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => return Err(ServeError::ListenerClosed),
                _ = phase.draining() => return Err(ServeError::ListenerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((io, peer, permit)) => {
                    let routes = routes.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        route(io, peer, permit, tls, read_timeout, routes).await;
                    });
                }
                Err(ListenerError::Accept(e)) if is_transient(&e) => {
                    tracing::debug!(error = %e, "Transient accept error");
                }
                Err(ListenerError::Accept(e)) => {
                    tracing::error!(error = %e, "Accept failed");
                    return Err(ServeError::Accept(Arc::new(e)));
                }
                Err(e) => return Err(ServeError::Accept(Arc::new(io::Error::other(e.to_string())))),
            }
        }
    }
}

async fn route(
    io: BoxedIo,
    peer: PeerAddr,
    permit: ConnectionPermit,
    tls: Option<Arc<dyn CertificateProvider>>,
    read_timeout: Duration,
    routes: Routes,
) {
    let io = match tls {
        Some(provider) => {
            match tokio::time::timeout(read_timeout, tls::accept(provider.as_ref(), io)).await {
                Ok(Ok(io)) => io,
                Ok(Err(e)) => {
                    tracing::debug!(peer_addr = %peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer_addr = %peer, "TLS handshake timed out");
                    return;
                }
            }
        }
        None => io,
    };

    let (tx, protocol) = match routes {
        Routes::Combined(tx) => (tx, "combined"),
        Routes::Split { rpc, http } => {
            let mut io = io;
            let (protocol, prefix) = match tokio::time::timeout(read_timeout, detect::sniff(&mut io)).await {
                Ok(Ok(Some(found))) => found,
                Ok(Ok(None)) => {
                    tracing::debug!(peer_addr = %peer, "Connection closed before detection");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer_addr = %peer, error = %e, "Detection read failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer_addr = %peer, "Protocol detection timed out");
                    return;
                }
            };
            let io: BoxedIo = Box::new(PrefixedIo::new(prefix, io));
            let tx = match protocol {
                Protocol::Rpc => rpc,
                Protocol::Http => http,
            };
            return deliver(tx, Accepted { io, peer, permit }, protocol.as_str()).await;
        }
    };

    deliver(tx, Accepted { io, peer, permit }, protocol).await
}

async fn deliver(tx: mpsc::Sender<Accepted>, accepted: Accepted, server: &'static str) {
    let peer = accepted.peer;
    if tx.send(accepted).await.is_err() {
        tracing::debug!(peer_addr = %peer, server, "Server gone, dropping connection");
        return;
    }
    metrics::record_connection(server);
    tracing::trace!(peer_addr = %peer, server, "Connection routed");
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
