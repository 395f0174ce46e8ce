//! Announces and withdraws this runtime instance.
//!
//! # Responsibilities
//! - Build the registration record from the address the listener actually
//!   bound (ephemeral ports are resolved, wildcard hosts replaced)
//! - Announce with bounded, jittered retries; exhausting them fails startup
//! - Withdraw the same record exactly once

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::error::Error;
use crate::lifecycle::lock;
use crate::net::LocalAddr;
use crate::observability::metrics;
use crate::registry::{Node, Registration, Registry};
use crate::resilience::RetryPolicy;

pub struct RegistrationManager {
    registry: Arc<dyn Registry>,
    policy: RetryPolicy,
    ttl: Duration,
    current: Mutex<Option<Registration>>,
}

impl RegistrationManager {
    pub fn new(registry: Arc<dyn Registry>, policy: RetryPolicy, ttl: Duration) -> Self {
        Self {
            registry,
            policy,
            ttl,
            current: Mutex::new(None),
        }
    }

    /// The announced record, until withdrawn.
    pub fn current(&self) -> Option<Registration> {
        lock(&self.current).clone()
    }

    /// Announce `name`/`version` at `local`.
    pub async fn announce(&self, name: &str, version: &str, local: &LocalAddr) -> Result<Registration, Error> {
        let registration = Registration {
            name: name.to_string(),
            version: version.to_string(),
            node: Node {
                id: format!("{}-{}", name, Uuid::new_v4()),
                address: advertise(local),
            },
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.registry.register(&registration, self.ttl).await {
                Ok(()) => {
                    metrics::record_registration(true);
                    tracing::info!(
                        registry = self.registry.name(),
                        service = %registration.name,
                        node_id = %registration.node.id,
                        address = %registration.node.address,
                        "Service registered"
                    );
                    *lock(&self.current) = Some(registration.clone());
                    return Ok(registration);
                }
                Err(source) => {
                    metrics::record_registration(false);
                    if !self.policy.should_retry(attempt) {
                        tracing::error!(attempt, error = %source, "Service registration failed");
                        return Err(Error::Registration {
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = self.policy.delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "Service registration failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Withdraw the announced record. Later calls do nothing.
    pub async fn withdraw(&self) -> Result<(), Error> {
        let taken = lock(&self.current).take();
        let Some(registration) = taken else {
            return Ok(());
        };

        match self.registry.deregister(&registration).await {
            Ok(()) => {
                tracing::info!(node_id = %registration.node.id, "Service deregistered");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(node_id = %registration.node.id, error = %e, "Service deregistration failed");
                Err(Error::Deregistration(e))
            }
        }
    }
}

impl std::fmt::Debug for RegistrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationManager")
            .field("registry", &self.registry.name())
            .field("policy", &self.policy)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Address other hosts can reach `local` on.
pub fn advertise(local: &LocalAddr) -> String {
    match local {
        LocalAddr::Tcp(addr) if addr.ip().is_unspecified() => {
            SocketAddr::new(outbound_ip(addr.ip()), addr.port()).to_string()
        }
        other => other.to_string(),
    }
}

/// The interface address used for outbound traffic. Connecting a UDP socket
/// sends nothing but makes the OS pick a source address.
fn outbound_ip(wildcard: IpAddr) -> IpAddr {
    let (bind, probe): (SocketAddr, SocketAddr) = match wildcard {
        IpAddr::V4(_) => (
            (Ipv4Addr::UNSPECIFIED, 0).into(),
            (Ipv4Addr::new(192, 0, 2, 1), 9).into(),
        ),
        IpAddr::V6(v6) => (
            (v6, 0).into(),
            (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 9).into(),
        ),
    };

    UdpSocket::bind(bind)
        .and_then(|socket| {
            socket.connect(probe)?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(match wildcard {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        })
}
