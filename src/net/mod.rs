//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Bind target ("host:port" | "unix://path")
//!     → listener.rs (bind, accept loop, connection limits)
//!     → tls.rs (optional TLS handshake, provider asked per connection)
//!     → demux (protocol detection)
//!     → connection.rs (drain accounting)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{BindTarget, BoxedIo, Listener, ListenerError, LocalAddr, PeerAddr};
pub use tls::{CertificateProvider, ReloadableTls};
