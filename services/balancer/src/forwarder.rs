//! Connection forwarder.
//!
//! Listens on a local address (the DNAT target of a service's virtual
//! address), dials an instance from the pool for every accepted connection
//! and relays it with the service's protocol shim.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use ferry_model::{ConnectionEvent, EventSink, Instance, Protocol};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{BalancerError, ErrorReporter};
use crate::pool::InstancePool;
use crate::shim;

/// Dial attempts per accepted connection.
pub const MAX_ATTEMPTS: usize = 5;

/// Default instance dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// What a forwarder needs besides its listener and pool.
#[derive(Clone)]
pub struct ForwarderContext {
    pub service: String,
    pub sink: Arc<dyn EventSink>,
    pub errors: ErrorReporter,
    pub connect_timeout: Duration,
}

/// State shared by the accept loop and every connection task.
struct Shared {
    ctx: ForwarderContext,
    pool: Arc<InstancePool>,
    /// Read per connection so changes apply without a restart.
    protocol: ArcSwap<Protocol>,
}

/// A running forwarder for one service.
pub struct Forwarder {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
}

impl Forwarder {
    /// Bind `bind_addr` and start accepting connections.
    ///
    /// Also starts the pool's reactivation timer; both stop with the
    /// forwarder.
    pub async fn start(
        bind_addr: SocketAddr,
        protocol: Protocol,
        pool: Arc<InstancePool>,
        ctx: ForwarderContext,
    ) -> Result<Self, BalancerError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| BalancerError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BalancerError::Bind {
                addr: bind_addr,
                source,
            })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let timer_task = pool.spawn_reactivation(shutdown_rx.clone());

        let shared = Arc::new(Shared {
            ctx,
            pool,
            protocol: ArcSwap::from_pointee(protocol),
        });
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown_rx));

        info!(
            service = %shared.ctx.service,
            bind_addr = %local_addr,
            protocol = %shared.protocol.load_full(),
            "Forwarder started"
        );

        Ok(Self {
            shared,
            local_addr,
            shutdown,
            accept_task: Some(accept_task),
            timer_task: Some(timer_task),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.shared.pool
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::clone(&self.shared.protocol.load())
    }

    /// Relay connections accepted from now on with `protocol`.
    pub fn set_protocol(&self, protocol: Protocol) {
        let protocol = Arc::new(protocol);
        let previous = self.shared.protocol.swap(Arc::clone(&protocol));
        debug!(
            service = %self.shared.ctx.service,
            from = %previous,
            to = %protocol,
            "Forwarder protocol changed"
        );
    }

    /// Stop accepting and stop the pool timer.
    ///
    /// Connections already being relayed run to completion.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        for task in [self.accept_task.take(), self.timer_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = task.await {
                warn!(service = %self.shared.ctx.service, error = %e, "Forwarder task failed");
            }
        }
        info!(
            service = %self.shared.ctx.service,
            bind_addr = %self.local_addr,
            "Forwarder stopped"
        );
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let span = tracing::info_span!(
                        "connection",
                        service = %shared.ctx.service,
                        peer = %peer
                    );
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move { shared.handle(stream, peer).await }.instrument(span));
                }
                Err(source) => {
                    error!(
                        service = %shared.ctx.service,
                        error = %source,
                        "Accept failed, forwarder stopping"
                    );
                    shared.ctx.errors.report(
                        &shared.ctx.service,
                        BalancerError::Accept {
                            service: shared.ctx.service.clone(),
                            source,
                        },
                    );
                    break;
                }
            },
        }
    }
}

impl Shared {
    async fn handle(&self, inbound: TcpStream, peer: SocketAddr) {
        let service = &self.ctx.service;

        for attempt in 1..=MAX_ATTEMPTS {
            let Some(instance) = self.pool.pick_instance() else {
                warn!(service = %service, "No instance available, closing connection");
                self.ctx
                    .errors
                    .report(service, BalancerError::NoInstance(service.clone()));
                return;
            };

            let Some(outbound) = self.dial(&instance, attempt).await else {
                self.pool.failed(&instance);
                continue;
            };
            self.pool.succeeded(&instance);

            let outbound_addr = match outbound.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    debug!(
                        instance = %instance,
                        error = %e,
                        "Instance connection lost before relay"
                    );
                    return;
                }
            };
            let _ = outbound.set_nodelay(true);
            let _ = inbound.set_nodelay(true);

            let conn = ConnectionEvent {
                service: service.clone(),
                instance,
                inbound: peer,
                outbound: outbound_addr,
                protocol: Protocol::clone(&self.protocol.load()),
            };
            self.ctx.sink.connection(conn.clone());

            // Relay errors end this connection only.
            if let Err(e) = shim::relay(inbound, outbound, conn, Arc::clone(&self.ctx.sink)).await {
                debug!(error = %e, "Relay ended with error");
            }
            return;
        }

        warn!(service = %service, attempts = MAX_ATTEMPTS, "Giving up on connection");
        self.ctx.errors.report(
            service,
            BalancerError::AttemptsExhausted {
                service: service.clone(),
                attempts: MAX_ATTEMPTS,
            },
        );
    }

    async fn dial(&self, instance: &Instance, attempt: usize) -> Option<TcpStream> {
        let connect = TcpStream::connect(instance.address);
        match tokio::time::timeout(self.ctx.connect_timeout, connect).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                debug!(instance = %instance, attempt, error = %e, "Instance dial failed");
                None
            }
            Err(_) => {
                debug!(
                    instance = %instance,
                    attempt,
                    timeout_ms = self.ctx.connect_timeout.as_millis() as u64,
                    "Instance dial timed out"
                );
                None
            }
        }
    }
}
