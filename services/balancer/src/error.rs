//! Balancer error types and the operational error sink.

use std::io;
use std::net::SocketAddr;

use ferry_netfilter::NetfilterError;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by the balancer core.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A forwarder could not open its listening socket.
    #[error("failed to bind forwarder on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A packet-filter command failed.
    #[error("packet filter: {0}")]
    Netfilter(#[from] NetfilterError),

    /// The pool had nothing to offer for a connection.
    #[error("no instance available for service {0}")]
    NoInstance(String),

    /// Every connection attempt for one inbound connection failed.
    #[error("gave up on service {service} after {attempts} connection attempts")]
    AttemptsExhausted { service: String, attempts: usize },

    /// The accept loop died; the forwarder is gone.
    #[error("accept loop for service {service} failed: {source}")]
    Accept {
        service: String,
        #[source]
        source: io::Error,
    },
}

/// An error posted for the surrounding daemon.
#[derive(Debug)]
pub struct OperationalError {
    pub service: String,
    pub error: BalancerError,
}

impl OperationalError {
    /// True when the subsystem needs a restart.
    pub fn is_fatal(&self) -> bool {
        matches!(self.error, BalancerError::Accept { .. })
    }
}

/// Posts operational errors to whoever drains the receiver.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::UnboundedSender<OperationalError>,
}

impl ErrorReporter {
    /// Create a reporter and its receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperationalError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, service: &str, error: BalancerError) {
        // A closed receiver means the daemon is already going down.
        let _ = self.tx.send(OperationalError {
            service: service.to_string(),
            error,
        });
    }
}
