//! Termination signal handling.
//!
//! # Responsibilities
//! - Translate OS signals (SIGINT, SIGTERM, SIGQUIT) into [`Termination`] events
//! - Let callers inject terminations without touching OS signals (tests,
//!   embedding applications)
//!
//! # Design Decisions
//! - Events are broadcast: the run loop and an in-progress shutdown both see
//!   them, so a second signal during drain forces termination
//! - The OS forwarder is a task spawned at start and stopped with the runtime

use std::fmt;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why termination was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
    Quit,
    /// Injected through [`Signals::trigger`].
    Requested,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Termination::Interrupt => "SIGINT",
            Termination::Terminate => "SIGTERM",
            Termination::Quit => "SIGQUIT",
            Termination::Requested => "requested",
        };
        f.write_str(name)
    }
}

/// Source of termination events.
#[derive(Debug, Clone)]
pub struct Signals {
    tx: broadcast::Sender<Termination>,
}

impl Signals {
    /// A source that only fires when [`trigger`](Self::trigger)ed.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(8);
        Self { tx }
    }

    /// Deliver a termination to every current listener.
    pub fn trigger(&self, termination: Termination) {
        let _ = self.tx.send(termination);
    }

    pub fn subscribe(&self) -> SignalListener {
        SignalListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Forward OS termination signals into this source until `stop` fires.
    pub fn forward_os_signals(&self, stop: CancellationToken) -> std::io::Result<JoinHandle<()>> {
        let tx = self.tx.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut interrupt = signal(SignalKind::interrupt())?;
            let mut terminate = signal(SignalKind::terminate())?;
            let mut quit = signal(SignalKind::quit())?;

            Ok(tokio::spawn(async move {
                loop {
                    let termination = tokio::select! {
                        _ = stop.cancelled() => return,
                        Some(()) = interrupt.recv() => Termination::Interrupt,
                        Some(()) = terminate.recv() => Termination::Terminate,
                        Some(()) = quit.recv() => Termination::Quit,
                        else => return,
                    };
                    tracing::debug!(signal = %termination, "Signal received");
                    let _ = tx.send(termination);
                }
            }))
        }

        #[cfg(not(unix))]
        {
            Ok(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        res = tokio::signal::ctrl_c() => {
                            if res.is_err() {
                                return;
                            }
                            let _ = tx.send(Termination::Interrupt);
                        }
                    }
                }
            }))
        }
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives terminations delivered after it subscribed.
#[derive(Debug)]
pub struct SignalListener {
    rx: broadcast::Receiver<Termination>,
}

impl SignalListener {
    /// Wait for the next termination. Never resolves once the source is gone.
    pub async fn recv(&mut self) -> Termination {
        loop {
            match self.rx.recv().await {
                Ok(termination) => return termination,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_listener_sees_trigger() {
        let signals = Signals::new();
        let mut a = signals.subscribe();
        let mut b = signals.subscribe();

        signals.trigger(Termination::Requested);
        assert_eq!(a.recv().await, Termination::Requested);
        assert_eq!(b.recv().await, Termination::Requested);
    }

    #[tokio::test]
    async fn late_listener_misses_earlier_signal() {
        let signals = Signals::new();
        signals.trigger(Termination::Interrupt);

        let mut late = signals.subscribe();
        let res = tokio::time::timeout(Duration::from_millis(20), late.recv()).await;
        assert!(res.is_err());
    }
}
